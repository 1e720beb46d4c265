//! Request/response pairing over a half-duplex link
//!
//! The correlator never touches the socket. It decides what may be written
//! next and which pending request a response frame belongs to; the session
//! performs the actual I/O.

use crate::types::{Epoch, Token};
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// A request waiting to be sent or answered
#[derive(Debug)]
pub struct PendingRequest<T> {
    pub bytes: Bytes,
    pub token: Option<Token>,
    pub context: T,
    /// Connection epoch the request belongs to
    pub epoch: Epoch,
    /// Set when the request is written to the wire
    pub issued_at: Option<Instant>,
}

/// Outcome of `Correlator::submit`
#[derive(Debug)]
pub enum Submitted<T> {
    Queued,
    /// Queue full: the newest request is handed back
    Overflow(T),
}

/// Pairs outbound requests with inbound responses
pub struct Correlator<T> {
    epoch: Epoch,
    timeout: Duration,
    max_queued: usize,
    max_in_flight: usize,
    in_flight: VecDeque<PendingRequest<T>>,
    queued: VecDeque<PendingRequest<T>>,
}

impl<T> Correlator<T> {
    /// Strictly serialized correlator: one request on the wire at a time
    pub fn half_duplex(timeout: Duration, max_queued: usize) -> Self {
        Self::new(timeout, max_queued, 1)
    }

    /// Correlator allowing `max_in_flight` tokenized requests at once
    pub fn new(timeout: Duration, max_queued: usize, max_in_flight: usize) -> Self {
        Self {
            epoch: 0,
            timeout,
            max_queued,
            max_in_flight: max_in_flight.max(1),
            in_flight: VecDeque::new(),
            queued: VecDeque::new(),
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.queued.is_empty()
    }

    /// Whether any pending request (queued or on the wire) satisfies `pred`
    pub fn any_pending(&self, mut pred: impl FnMut(&T) -> bool) -> bool {
        self.in_flight
            .iter()
            .chain(self.queued.iter())
            .any(|p| pred(&p.context))
    }

    /// Queue a request for sending
    pub fn submit(&mut self, bytes: Bytes, token: Option<Token>, context: T) -> Submitted<T> {
        if self.queued.len() >= self.max_queued {
            tracing::warn!(
                "Request queue full ({} waiting), dropping newest request",
                self.queued.len()
            );
            return Submitted::Overflow(context);
        }

        self.queued.push_back(PendingRequest {
            bytes,
            token,
            context,
            epoch: self.epoch,
            issued_at: None,
        });
        Submitted::Queued
    }

    /// Move queued requests onto the wire while capacity allows
    ///
    /// Returns the bytes to write, in order.
    pub fn dispatch(&mut self, now: Instant) -> Vec<Bytes> {
        let mut out = Vec::new();
        while self.in_flight.len() < self.max_in_flight {
            // Untokenized requests can only ever be paired one at a time
            if !self.in_flight.is_empty()
                && (self.in_flight.iter().any(|p| p.token.is_none())
                    || self.queued.front().is_some_and(|p| p.token.is_none()))
            {
                break;
            }
            let Some(mut next) = self.queued.pop_front() else {
                break;
            };
            next.issued_at = Some(now);
            out.push(next.bytes.clone());
            self.in_flight.push_back(next);
        }
        out
    }

    /// Match a response frame read under `frame_epoch`
    ///
    /// Returns `None` when the frame belongs to an older connection or no
    /// pending request matches; such frames are discarded.
    pub fn on_response(&mut self, frame_epoch: Epoch, token: Option<Token>) -> Option<PendingRequest<T>> {
        if frame_epoch != self.epoch {
            tracing::debug!(
                "Discarding response from epoch {} (current {})",
                frame_epoch,
                self.epoch
            );
            return None;
        }

        let index = match token {
            Some(t) => self.in_flight.iter().position(|p| p.token == Some(t)),
            None => {
                if self.in_flight.is_empty() {
                    None
                } else {
                    Some(0)
                }
            }
        };

        let Some(index) = index else {
            tracing::debug!("Response with no matching request (token {:?})", token);
            return None;
        };

        self.in_flight.remove(index)
    }

    /// Earliest moment an in-flight request times out
    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight
            .iter()
            .filter_map(|p| p.issued_at)
            .min()
            .map(|t| t + self.timeout)
    }

    /// Remove and return a request whose response is overdue
    pub fn expire(&mut self, now: Instant) -> Option<PendingRequest<T>> {
        let index = self
            .in_flight
            .iter()
            .position(|p| p.issued_at.is_some_and(|t| now >= t + self.timeout))?;
        self.in_flight.remove(index)
    }

    /// Clear all state for a new connection epoch
    ///
    /// Returns every request that was pending so its caller can be failed.
    pub fn reset(&mut self, epoch: Epoch) -> Vec<PendingRequest<T>> {
        self.epoch = epoch;
        self.in_flight.drain(..).chain(self.queued.drain(..)).collect()
    }
}
