use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// The JSON payload envelope persisted alongside raw contents.
///
/// Backends without native metadata columns store the whole envelope;
/// `retry` and `timeout` default to 0 when absent in the stored JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub contents: String,

    #[serde(default)]
    pub retry: u32,

    #[serde(default)]
    pub timeout: f64,
}

impl Envelope {
    pub fn new(contents: impl Into<String>) -> Self {
        Envelope {
            contents: contents.into(),
            retry: 0,
            timeout: 0.0,
        }
    }

    pub fn with_timeout(contents: impl Into<String>, timeout: f64) -> Self {
        Envelope {
            contents: contents.into(),
            retry: 0,
            timeout,
        }
    }

    /// A copy scheduled for redelivery with the retry counter bumped.
    pub fn retried(&self) -> Self {
        Envelope {
            contents: self.contents.clone(),
            retry: self.retry + 1,
            timeout: self.timeout,
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(CoreError::Encode)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(CoreError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let envelope = Envelope::with_timeout("payload", 5.0);
        let raw = envelope.encode().unwrap();
        assert_eq!(Envelope::decode(&raw).unwrap(), envelope);
    }

    #[test]
    fn test_absent_fields_default_to_zero() {
        let envelope = Envelope::decode(r#"{"contents":"x"}"#).unwrap();
        assert_eq!(envelope.retry, 0);
        assert_eq!(envelope.timeout, 0.0);
    }

    #[test]
    fn test_retried_increments() {
        let envelope = Envelope::new("x").retried().retried();
        assert_eq!(envelope.retry, 2);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Envelope::decode("not json").is_err());
    }
}
