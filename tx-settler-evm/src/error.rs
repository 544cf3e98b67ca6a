use alloy::transports::{RpcError, TransportError, TransportErrorKind};
use anyhow::anyhow;
use thiserror::Error;
use tx_settler::ledger::LedgerError;

pub type Result<T> = std::result::Result<T, EvmError>;

#[derive(Error, Debug)]
pub enum EvmError {
    #[error("Invalid ledger chain signing key: {0}")]
    InvalidKey(anyhow::Error),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// Classify an alloy transport error.
///
/// Errors returned by the node keep their code and message, so that transient node
/// conditions can be recognized. A gone backend means the connection must be replaced.
pub fn map_rpc_error(err: TransportError) -> LedgerError {
    match err {
        RpcError::ErrorResp(payload) => LedgerError::Rpc {
            code: payload.code,
            message: payload.message.to_string(),
        },
        RpcError::NullResp => LedgerError::NotFound,
        RpcError::Transport(TransportErrorKind::BackendGone) => LedgerError::ConnectionClosed,
        RpcError::Transport(kind) => {
            let message = kind.to_string();
            let timeout = is_timeout_message(&message);
            LedgerError::Transport { message, timeout }
        }
        err => LedgerError::Other(anyhow!(err)),
    }
}

fn is_timeout_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("timed out") || message.contains("timeout")
}

#[cfg(test)]
mod tests {
    use alloy::rpc::json_rpc::ErrorPayload;
    use tx_settler::retry::{ErrorPolicy, ErrorPolicyProvider};

    use super::*;

    fn node_error(code: i64, message: &'static str) -> TransportError {
        RpcError::ErrorResp(ErrorPayload {
            code,
            message: message.into(),
            data: None,
        })
    }

    #[test]
    fn node_errors_keep_code_and_message() {
        let err = map_rpc_error(node_error(-32000, "nonce too low: next nonce 5, tx nonce 4"));

        assert!(matches!(err, LedgerError::Rpc { code: -32000, .. }));
        assert_eq!(err.get_error_policy(), ErrorPolicy::Retry);
        assert!(!err.is_transport_broken());

        let err = map_rpc_error(node_error(3, "execution reverted"));
        assert_eq!(err.get_error_policy(), ErrorPolicy::Exit);
    }

    #[test]
    fn gone_backend_closes_the_connection() {
        let err = map_rpc_error(TransportErrorKind::backend_gone());

        assert!(matches!(err, LedgerError::ConnectionClosed));
        assert!(err.is_transport_broken());
    }

    #[test]
    fn timeouts_break_the_transport() {
        let timeout = map_rpc_error(TransportErrorKind::custom_str("operation timed out"));
        let refused = map_rpc_error(TransportErrorKind::custom_str("connection refused"));

        assert!(timeout.is_transport_broken());
        assert!(!refused.is_transport_broken());
        assert_eq!(refused.get_error_policy(), ErrorPolicy::Retry);
    }

    #[test]
    fn null_responses_are_not_found() {
        assert!(matches!(map_rpc_error(RpcError::NullResp), LedgerError::NotFound));
    }
}
