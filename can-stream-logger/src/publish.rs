//! Publish sinks for the `publish` job
//!
//! The messaging layer itself lives outside this crate; the listener only
//! needs somewhere to hand `(topic, payload)` pairs to.

use crate::types::format_payload;

/// A failed publish, reported back to the listener for logging
#[derive(Debug, thiserror::Error)]
#[error("Publishing to {topic} failed: {reason}")]
pub struct PublishError {
    pub topic: String,
    pub reason: String,
}

/// Destination of forwarded frames when the listener job is `publish`
pub trait PublishSink: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;
}

/// Publisher that writes every message to the log instead of a broker
#[derive(Debug, Default, Clone)]
pub struct LogPublisher;

impl PublishSink for LogPublisher {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        log::info!("[PUBLISH] {} <- {}", topic, format_payload(payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_publisher_accepts_everything() {
        let publisher = LogPublisher;
        assert!(publisher.publish("avl/speed", &[1, 2]).is_ok());
        assert!(publisher.publish("", &[]).is_ok());
    }

    #[test]
    fn test_publish_error_message() {
        let err = PublishError {
            topic: "avl/rpm".to_string(),
            reason: "not connected".to_string(),
        };
        assert_eq!(err.to_string(), "Publishing to avl/rpm failed: not connected");
    }
}
