use crate::error::ParseError;
use crate::framing::Framing;
use crate::types::{Observation, Token, Value};

/// What an inbound frame is, as far as the correlator is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Answer to an outstanding request
    Response { token: Option<Token> },
    /// Unsolicited device notification (e.g. a `NOTIFY` prefix)
    Notification,
    /// Banner, echo or keep-alive with no meaning to the engine
    Noise,
}

/// Decoded answer to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Device reported one or more attribute values
    Observed(Vec<Observation>),
    /// Command accepted, no values reported
    Ack,
    /// Well-formed negative acknowledgement
    Rejected(String),
}

/// Vendor-specific half of a driver
///
/// Implementations are plain parse/format code: they never touch sockets or
/// timers. Commands returned from `poll_command` and `set_command` are written
/// to the wire as-is, so they must include any terminator the device expects.
pub trait DeviceProtocol: Send + 'static {
    /// Framing rule for inbound bytes
    fn framing(&self) -> Framing;

    /// Decide whether a frame answers a request or is unsolicited
    fn classify(&self, frame: &[u8]) -> FrameKind;

    /// Decode the answer to `request`
    ///
    /// An `Err` means the frame does not belong to this request and the link
    /// is considered out of sync.
    fn parse_response(&self, request: &[u8], frame: &[u8]) -> Result<Reply, ParseError>;

    /// Decode an unsolicited notification
    fn parse_notification(&self, frame: &[u8]) -> Result<Vec<Observation>, ParseError>;

    /// Command enquiring the current value of `attribute`
    fn poll_command(&self, attribute: &str) -> Option<Vec<u8>>;

    /// Command driving `attribute` to `value`
    fn set_command(&self, attribute: &str, value: &Value) -> Option<Vec<u8>>;

    /// Correlation token embedded in an outbound request, if the protocol has one
    fn request_token(&self, _request: &[u8]) -> Option<Token> {
        None
    }
}
