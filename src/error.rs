//! Error types for the bridge.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("failed to bind a local UDP port: {0}")]
    PortBind(std::io::Error),

    #[error("failed to spawn transcode pipeline: {0}")]
    PipelineSpawn(std::io::Error),

    #[error("transcode pipeline exited during startup: {0}")]
    PipelineEarlyExit(String),

    #[error("sfu operation failed: {0}")]
    Sfu(String),

    #[error("analysis forward failed (status {status:?}): {body}")]
    Forward {
        status: Option<u16>,
        body: String,
    },

    #[error("egress start failed after {attempts} attempts: {last}")]
    EgressExhausted { attempts: u32, last: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Upstream HTTP status for forward failures, if one was received.
    pub fn forward_status(&self) -> Option<u16> {
        match self {
            BridgeError::Forward { status, .. } => *status,
            _ => None,
        }
    }

    /// Upstream body snippet for forward failures.
    pub fn forward_body(&self) -> Option<&str> {
        match self {
            BridgeError::Forward { body, .. } => Some(body.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_display_carries_status_and_body() {
        let error = BridgeError::Forward {
            status: Some(429),
            body: "queue_full".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "analysis forward failed (status Some(429)): queue_full"
        );
        assert_eq!(error.forward_status(), Some(429));
        assert_eq!(error.forward_body(), Some("queue_full"));
    }

    #[test]
    fn non_forward_errors_have_no_upstream_status() {
        let error = BridgeError::Sfu("consume rejected".to_string());
        assert_eq!(error.forward_status(), None);
        assert_eq!(error.forward_body(), None);
    }

    #[test]
    fn exhausted_display_names_attempts() {
        let error = BridgeError::EgressExhausted {
            attempts: 10,
            last: "bind race".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "egress start failed after 10 attempts: bind race"
        );
    }
}
