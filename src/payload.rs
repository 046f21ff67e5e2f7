//! Request/reply payload carried between the pool and its workers.

/// Reply context by which a worker asks to be retired after this reply.
pub const STOP_REQUEST: &[u8] = b"{\"stop\":true}";

/// An opaque request or reply: a body plus side-channel context bytes.
///
/// The pool imposes no encoding on either field; the only value it
/// interprets is the stop request (empty body, [`STOP_REQUEST`] context).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    /// Opaque request/reply body.
    pub body: Vec<u8>,
    /// Opaque metadata accompanying the body.
    pub context: Vec<u8>,
}

impl Payload {
    /// Create a payload from body and context bytes.
    pub fn new(body: impl Into<Vec<u8>>, context: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            context: context.into(),
        }
    }

    /// Create a payload with only a body.
    pub fn from_body(body: impl Into<Vec<u8>>) -> Self {
        Self::new(body, Vec::new())
    }

    /// The reserved reply by which a worker asks for retirement.
    pub fn stop_request() -> Self {
        Self::new(Vec::new(), STOP_REQUEST)
    }

    /// True if this reply is the stop request.
    pub fn is_stop_request(&self) -> bool {
        self.body.is_empty() && self.context == STOP_REQUEST
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_request_is_13_bytes() {
        assert_eq!(STOP_REQUEST.len(), 13);
        assert_eq!(STOP_REQUEST, b"{\"stop\":true}");
    }

    #[test]
    fn test_stop_request_detection() {
        assert!(Payload::stop_request().is_stop_request());
        assert!(Payload::new("", STOP_REQUEST).is_stop_request());

        // Non-empty body disqualifies the sentinel
        assert!(!Payload::new("data", STOP_REQUEST).is_stop_request());
        // Context must match exactly
        assert!(!Payload::new("", "{\"stop\": true}").is_stop_request());
        assert!(!Payload::from_body("ok").is_stop_request());
        assert!(!Payload::default().is_stop_request());
    }
}
