use anyhow::anyhow;
use jsonrpsee::core::client::Error as RpcClientError;
use plutus_ledger_api::csl::{csl_to_pla::TryFromCSLError, pla_to_csl::TryFromPLAError};
use thiserror::Error;
use tx_settler::{chain_query::ChainQueryError, submitter::SubmitterError};

pub type Result<T> = std::result::Result<T, OgmiosError>;

#[derive(Error, Debug)]
pub enum OgmiosError {
    #[error(transparent)]
    TryFromPLAError(#[from] TryFromPLAError),

    #[error(transparent)]
    TryFromCSLError(#[from] TryFromCSLError),

    #[error("Couldn't convert a {label} from Ogmios response: {source}")]
    ConversionError {
        label: String,
        source: anyhow::Error,
    },

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error("Failed to start Ogmios: {0}")]
    StartupError(anyhow::Error),

    #[error("Transaction {0} was not confirmed in time")]
    ConfirmationTimeout(String),

    #[error(transparent)]
    JSONRpcError(#[from] RpcClientError),
}

impl OgmiosError {
    /// Errors of the connection itself, as opposed to errors returned by Ogmios
    pub fn is_transport_error(&self) -> bool {
        match self {
            OgmiosError::JSONRpcError(err) => matches!(
                err,
                RpcClientError::Transport(_)
                    | RpcClientError::RestartNeeded(_)
                    | RpcClientError::RequestTimeout
            ),
            OgmiosError::RequestError(_)
            | OgmiosError::StartupError(_)
            | OgmiosError::ConfirmationTimeout(_) => true,
            _ => false,
        }
    }
}

impl From<OgmiosError> for ChainQueryError {
    fn from(err: OgmiosError) -> ChainQueryError {
        if err.is_transport_error() {
            ChainQueryError::Transport(anyhow!(err))
        } else {
            ChainQueryError::Other(anyhow!(err))
        }
    }
}

impl From<OgmiosError> for SubmitterError {
    fn from(err: OgmiosError) -> SubmitterError {
        match err {
            err if err.is_transport_error() => SubmitterError::Transport(anyhow!(err)),
            OgmiosError::JSONRpcError(RpcClientError::Call(call)) => {
                SubmitterError::Rejected(anyhow!("{} (code {})", call.message(), call.code()))
            }
            err => SubmitterError::Other(anyhow!(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use jsonrpsee::types::ErrorObjectOwned;
    use tx_settler::retry::{ErrorPolicy, ErrorPolicyProvider};

    use super::*;

    #[test]
    fn closed_connections_are_retried() {
        let err: ChainQueryError =
            OgmiosError::JSONRpcError(RpcClientError::Custom("closed".to_string())).into();
        assert_eq!(err.get_error_policy(), ErrorPolicy::Exit);

        let err: ChainQueryError = OgmiosError::JSONRpcError(RpcClientError::RequestTimeout).into();
        assert_eq!(err.get_error_policy(), ErrorPolicy::Retry);
    }

    #[test]
    fn ledger_rejections_are_not_retried() {
        let rejection = ErrorObjectOwned::owned(
            3005,
            "Some transactions failed to pass validation",
            None::<()>,
        );
        let err: SubmitterError = OgmiosError::JSONRpcError(RpcClientError::Call(rejection)).into();

        assert!(matches!(err, SubmitterError::Rejected(_)));
        assert_eq!(err.get_error_policy(), ErrorPolicy::Exit);
    }

    #[test]
    fn confirmation_timeouts_are_retried() {
        let err: SubmitterError = OgmiosError::ConfirmationTimeout("abcd".to_string()).into();
        assert_eq!(err.get_error_policy(), ErrorPolicy::Retry);
    }
}
