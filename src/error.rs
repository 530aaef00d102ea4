//! Bridge error taxonomy
//!
//! Local validation failures (authorization, encoding) are raised before
//! anything reaches a transport. Remote failures carry the message the
//! signer or the network returned.

use thiserror::Error;

use crate::transport::TransportError;

/// JSON-RPC error code a signer uses when the user declines a request
pub const USER_REJECTED_CODE: i64 = 4001;

/// Errors surfaced by the bridge
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Target canister is not in the session whitelist
    #[error("Request failed: canister {canister_id} is not whitelisted for this session")]
    Authorization {
        /// The rejected canister id (text form)
        canister_id: String,
    },

    /// Transport round trip exceeded the caller deadline
    #[error("{handler} timed out after {after_ms}ms")]
    Timeout {
        /// Wire name of the handler that timed out
        handler: &'static str,
        /// Deadline that elapsed
        after_ms: u64,
    },

    /// The remote authority explicitly declined
    #[error("Rejected by user: {0}")]
    UserRejected(String),

    /// Malformed or unsupported payload
    #[error("Encoding error at `{path}`: {reason}")]
    Encoding {
        /// Field path of the offending value
        path: String,
        /// What was wrong with it
        reason: String,
    },

    /// The network node rejected the request
    #[error("Remote call failed: {0}")]
    RemoteCall(String),

    /// No established session
    #[error("Invalid session state: {0}")]
    State(String),

    /// Backend fault outside the categories above
    #[error(transparent)]
    Transport(TransportError),
}

impl BridgeError {
    /// Build an encoding error for a field path
    pub fn encoding(path: impl Into<String>, reason: impl Into<String>) -> Self {
        BridgeError::Encoding {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error came from the user declining
    pub fn is_user_rejection(&self) -> bool {
        matches!(self, BridgeError::UserRejected(_))
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

impl From<TransportError> for BridgeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout { handler, after_ms } => {
                BridgeError::Timeout { handler, after_ms }
            }
            TransportError::Remote { code, message } if code == USER_REJECTED_CODE => {
                BridgeError::UserRejected(message)
            }
            TransportError::Remote { message, .. } => BridgeError::RemoteCall(message),
            TransportError::InvalidData(reason) => BridgeError::encoding("response", reason),
            other => BridgeError::Transport(other),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::encoding("json", err.to_string())
    }
}

impl From<base64::DecodeError> for BridgeError {
    fn from(err: base64::DecodeError) -> Self {
        BridgeError::encoding("base64", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_rejection_code_maps_to_user_rejected() {
        let err: BridgeError = TransportError::Remote {
            code: USER_REJECTED_CODE,
            message: "declined".into(),
        }
        .into();
        assert!(err.is_user_rejection());

        let err: BridgeError = TransportError::Remote {
            code: -32000,
            message: "canister trapped".into(),
        }
        .into();
        assert_eq!(err, BridgeError::RemoteCall("canister trapped".into()));
    }

    #[test]
    fn test_transport_timeout_keeps_handler() {
        let err: BridgeError = TransportError::Timeout {
            handler: "requestCall",
            after_ms: 50,
        }
        .into();
        assert_eq!(
            err,
            BridgeError::Timeout {
                handler: "requestCall",
                after_ms: 50
            }
        );
    }

    #[test]
    fn test_disconnect_stays_transport_error() {
        let err: BridgeError = TransportError::Disconnected.into();
        assert!(matches!(err, BridgeError::Transport(TransportError::Disconnected)));
    }
}
