//! Inbound byte stream to frame conversion

use bytes::{Buf, Bytes, BytesMut};

/// Default upper bound on a buffered, unterminated frame
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// How a device delimits its messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// Frames end with this byte sequence (stripped); empty frames are skipped
    Delimited(Vec<u8>),
    /// Every frame has exactly this many bytes
    Fixed(usize),
    /// A header carries the payload length
    ///
    /// The length field of `width` bytes (1, 2 or 4) starts at `offset`.
    /// Total frame size is `offset + width + length + adjust`.
    LengthPrefixed {
        offset: usize,
        width: usize,
        big_endian: bool,
        adjust: isize,
    },
    /// Each read (UDP datagram) is a single frame
    Datagram,
}

impl Framing {
    /// Newline-terminated lines
    pub fn lines() -> Self {
        Framing::Delimited(b"\n".to_vec())
    }
}

/// Accumulates partial frames between reads
pub struct FrameBuffer {
    framing: Framing,
    buf: BytesMut,
    max_len: usize,
}

impl FrameBuffer {
    pub fn new(framing: Framing, max_len: usize) -> Self {
        Self {
            framing,
            buf: BytesMut::new(),
            max_len,
        }
    }

    /// Number of buffered bytes not yet forming a frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Discard any residual partial frame
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Add received bytes, returning every complete frame
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        if let Framing::Datagram = self.framing {
            if data.len() > self.max_len {
                tracing::warn!("Dropping oversized datagram ({} bytes)", data.len());
                return Vec::new();
            }
            return if data.is_empty() {
                Vec::new()
            } else {
                vec![Bytes::copy_from_slice(data)]
            };
        }

        self.buf.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            if !frame.is_empty() {
                frames.push(frame);
            }
        }

        if self.buf.len() > self.max_len {
            tracing::warn!(
                "Dropping {} buffered bytes with no frame boundary (limit {})",
                self.buf.len(),
                self.max_len
            );
            self.buf.clear();
        }

        frames
    }

    fn next_frame(&mut self) -> Option<Bytes> {
        match &self.framing {
            Framing::Delimited(delimiter) => {
                if delimiter.is_empty() {
                    return None;
                }
                let pos = self
                    .buf
                    .windows(delimiter.len())
                    .position(|w| w == delimiter.as_slice())?;
                let frame = self.buf.split_to(pos).freeze();
                self.buf.advance(delimiter.len());
                Some(frame)
            }
            Framing::Fixed(len) => {
                if *len == 0 || self.buf.len() < *len {
                    return None;
                }
                Some(self.buf.split_to(*len).freeze())
            }
            Framing::LengthPrefixed {
                offset,
                width,
                big_endian,
                adjust,
            } => {
                let header = offset + width;
                if self.buf.len() < header {
                    return None;
                }
                let field = &self.buf[*offset..header];
                let declared = read_length(field, *big_endian)?;
                let total = (header as isize + declared as isize + adjust).max(header as isize) as usize;
                if total > self.max_len {
                    tracing::warn!("Dropping frame declaring {} bytes (limit {})", total, self.max_len);
                    self.buf.clear();
                    return None;
                }
                if self.buf.len() < total {
                    return None;
                }
                Some(self.buf.split_to(total).freeze())
            }
            Framing::Datagram => None,
        }
    }
}

fn read_length(field: &[u8], big_endian: bool) -> Option<usize> {
    let mut value: usize = 0;
    match field.len() {
        1 | 2 | 4 => {}
        _ => return None,
    }
    if big_endian {
        for b in field {
            value = (value << 8) | *b as usize;
        }
    } else {
        for b in field.iter().rev() {
            value = (value << 8) | *b as usize;
        }
    }
    Some(value)
}
