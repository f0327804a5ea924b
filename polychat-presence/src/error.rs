//! Error taxonomy for the hub.
//!
//! Nothing here is process-fatal: every variant is scoped to one connection,
//! one broadcast, or bootstrap.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::error::CapacityError;

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// A connection arrived without a room or user identifier.
    #[error("missing {0}")]
    MissingIdentifier(&'static str),

    /// Upgrade requested on a path the hub does not serve.
    #[error("unknown path {0}")]
    UnknownPath(String),

    /// Inbound frame exceeded the configured bound.
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// No frame (not even a pong) within the read deadline.
    #[error("no frame received within {0:?}")]
    ReadTimeout(Duration),

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("transport error: {0}")]
    Transport(#[source] tungstenite::Error),

    /// Outbound queue at capacity; the peer is not keeping up.
    #[error("outbound queue full")]
    QueueFull,

    #[error("outbound queue closed")]
    QueueClosed,

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tungstenite::Error> for HubError {
    /// Oversized messages rejected by the transport's read limit are
    /// protocol violations, not transport failures.
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Capacity(CapacityError::MessageTooLong { size, max_size }) => {
                Self::FrameTooLarge {
                    size,
                    max: max_size,
                }
            }
            other => Self::Transport(other),
        }
    }
}

impl HubError {
    /// Read/write failures and deadline expiry.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ReadTimeout(_) | Self::WriteTimeout(_) | Self::Transport(_)
        )
    }

    /// Errors caused by the peer breaking the protocol.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::FrameTooLarge { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            HubError::MissingIdentifier("roomId").to_string(),
            "missing roomId"
        );
        assert_eq!(
            HubError::FrameTooLarge { size: 600, max: 512 }.to_string(),
            "frame of 600 bytes exceeds limit of 512"
        );
        assert_eq!(HubError::QueueFull.to_string(), "outbound queue full");
    }

    #[test]
    fn test_classification() {
        assert!(HubError::ReadTimeout(Duration::from_secs(1)).is_transport());
        assert!(HubError::WriteTimeout(Duration::from_secs(1)).is_transport());
        assert!(HubError::Transport(tungstenite::Error::ConnectionClosed).is_transport());
        assert!(!HubError::QueueFull.is_transport());

        assert!(HubError::FrameTooLarge { size: 2, max: 1 }.is_protocol_violation());
        assert!(!HubError::QueueClosed.is_protocol_violation());
    }

    #[test]
    fn test_read_limit_maps_to_frame_too_large() {
        let err = HubError::from(tungstenite::Error::Capacity(
            CapacityError::MessageTooLong {
                size: 8192,
                max_size: 512,
            },
        ));
        assert!(matches!(err, HubError::FrameTooLarge { size: 8192, max: 512 }));
        assert!(err.is_protocol_violation());
        assert!(!err.is_transport());

        let err = HubError::from(tungstenite::Error::ConnectionClosed);
        assert!(matches!(err, HubError::Transport(_)));
    }
}
