use std::fmt;

/// A claimed job handed to the work callback.
///
/// Constructed by a driver at claim time and never mutated: a redelivery
/// constructs a fresh message with the incremented retry counter.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Backend-assigned job id, also the claim key for resolution.
    pub id: String,

    /// Job contents as enqueued.
    pub contents: String,

    /// Number of times this job has been retried so far.
    pub retry_count: u32,

    /// Per-job timeout in seconds (0 = use the worker default).
    pub timeout: f64,
}

impl Message {
    pub fn new(id: impl Into<String>, contents: impl Into<String>, retry_count: u32, timeout: f64) -> Self {
        Message {
            id: id.into(),
            contents: contents.into(),
            retry_count,
            timeout,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_display_is_contents() {
        let message = Message::new("42", "hello work", 0, 0.0);
        assert_eq!(message.to_string(), "hello work");
        assert_eq!(message.id, "42");
        assert_eq!(message.retry_count, 0);
    }
}
