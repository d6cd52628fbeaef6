// src/error.rs
use ethers::providers::{ProviderError, RpcError};
use thiserror::Error;

/// Malformed numeric or hex input. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("Invalid decimal amount: {0:?}")]
    InvalidDecimal(String),

    #[error("Amount does not fit in 256 bits: {0}")]
    Overflow(String),

    #[error("Invalid hex string: {0:?}")]
    InvalidHex(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BundlerError {
    #[error("Bundler error: {message}")]
    JsonRpc { code: i64, message: String },

    #[error("Bundler rejected request: {0}")]
    Rejected(String),

    #[error("Bundler transport error: {0}")]
    Transport(String),
}

impl BundlerError {
    /// Only connection-level failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<ProviderError> for BundlerError {
    fn from(err: ProviderError) -> Self {
        if let Some(resp) = err.as_error_response() {
            return Self::JsonRpc {
                code: resp.code,
                message: resp.message.clone(),
            };
        }
        if err.as_serde_error().is_some() {
            return Self::Rejected(err.to_string());
        }
        Self::Transport(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum PaymasterError {
    #[error("Paymaster error: {message}")]
    JsonRpc { code: i64, message: String },

    #[error("Paymaster rejected request: {0}")]
    Rejected(String),

    #[error("Paymaster transport error: {0}")]
    Transport(String),

    #[error("Invalid UserOperation: {0}")]
    InvalidUserOperation(String),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("Failed to encode paymaster request: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<ProviderError> for PaymasterError {
    fn from(err: ProviderError) -> Self {
        if let Some(resp) = err.as_error_response() {
            return Self::JsonRpc {
                code: resp.code,
                message: resp.message.clone(),
            };
        }
        if err.as_serde_error().is_some() {
            return Self::Rejected(err.to_string());
        }
        Self::Transport(err.to_string())
    }
}

/// Chain RPC failure. Usually means "not mined yet" and is retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Chain query failed: {0}")]
pub struct ChainQueryError(pub String);

#[cfg(test)]
mod tests {
    use ethers::providers::{HttpClientError, JsonRpcError};

    use super::*;

    fn rpc_failure(code: i64, message: &str) -> ProviderError {
        ProviderError::JsonRpcClientError(Box::new(HttpClientError::JsonRpcError(JsonRpcError {
            code,
            message: message.to_string(),
            data: None,
        })))
    }

    fn malformed_body() -> ProviderError {
        let err = serde_json::from_str::<serde_json::Value>("<html>502 Bad Gateway</html>")
            .unwrap_err();
        ProviderError::JsonRpcClientError(Box::new(HttpClientError::SerdeJson {
            err,
            text: "<html>502 Bad Gateway</html>".to_string(),
        }))
    }

    #[test]
    fn json_rpc_error_response_is_terminal() {
        let err = BundlerError::from(rpc_failure(-32602, "invalid userOpHash"));
        assert_eq!(
            err,
            BundlerError::JsonRpc {
                code: -32602,
                message: "invalid userOpHash".into()
            }
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn unparseable_response_is_rejected() {
        let err = BundlerError::from(malformed_body());
        assert!(matches!(err, BundlerError::Rejected(_)), "{err:?}");
        assert!(!err.is_transient());

        let err = BundlerError::from(ProviderError::SerdeJson(
            serde_json::from_str::<u64>("\"x\"").unwrap_err(),
        ));
        assert!(matches!(err, BundlerError::Rejected(_)), "{err:?}");
    }

    #[test]
    fn other_provider_failures_are_transient() {
        let err = BundlerError::from(ProviderError::CustomError("connection refused".into()));
        assert!(matches!(err, BundlerError::Transport(_)), "{err:?}");
        assert!(err.is_transient());
    }

    #[test]
    fn paymaster_errors_follow_the_same_mapping() {
        assert!(matches!(
            PaymasterError::from(rpc_failure(-32000, "sender not whitelisted")),
            PaymasterError::JsonRpc { code: -32000, ref message } if message == "sender not whitelisted"
        ));
        assert!(matches!(
            PaymasterError::from(malformed_body()),
            PaymasterError::Rejected(_)
        ));
        assert!(matches!(
            PaymasterError::from(ProviderError::CustomError("timed out".into())),
            PaymasterError::Transport(_)
        ));
    }

    #[test]
    fn only_transport_errors_are_transient() {
        assert!(BundlerError::Transport("connection refused".into()).is_transient());
        assert!(!BundlerError::Rejected("502".into()).is_transient());
        assert!(!BundlerError::JsonRpc {
            code: -32602,
            message: "bad".into()
        }
        .is_transient());
    }

    #[test]
    fn bundler_error_displays_rpc_message() {
        let err = BundlerError::JsonRpc {
            code: -32500,
            message: "AA33 reverted".into(),
        };
        assert_eq!(err.to_string(), "Bundler error: AA33 reverted");
    }
}
