use thiserror::Error;

/// Failures raised by the contract pipeline.
///
/// `Token*` and `IllegalTransition` are expected, user-recoverable denials: the
/// caller should offer the signer a fresh link. `Certificate*`,
/// `SigningOperationFailed` and `StorageFailed` indicate server-side
/// misconfiguration and are for an administrator, never for the end signer.
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("signing token has expired")]
    TokenExpired,

    #[error("signing token was issued for role '{found}', expected '{expected}'")]
    TokenRoleMismatch { expected: String, found: String },

    #[error("signing token signature did not verify")]
    TokenSignatureInvalid,

    #[error("contract {0} not found")]
    ContractNotFound(String),

    #[error("illegal transition: contract is in state '{from}', cannot apply '{attempted}'")]
    IllegalTransition { from: String, attempted: String },

    #[error("source document missing at {0}")]
    SourceDocumentMissing(String),

    #[error("certificate bundle not found at {0}")]
    CertificateNotFound(String),

    #[error("certificate bundle password invalid")]
    CertificatePasswordInvalid,

    #[error("signing certificate has expired")]
    CertificateExpired,

    #[error("signing operation failed: {0}")]
    SigningOperationFailed(String),

    #[error("rendering failed: {0}")]
    RenderingFailed(String),

    #[error("storage operation failed: {0}")]
    StorageFailed(String),
}

impl ContractError {
    /// True for conditions the end signer can recover from by requesting a new
    /// link; false for operational failures that need an administrator.
    pub fn is_user_recoverable(&self) -> bool {
        matches!(
            self,
            ContractError::TokenExpired
                | ContractError::TokenRoleMismatch { .. }
                | ContractError::TokenSignatureInvalid
                | ContractError::IllegalTransition { .. }
        )
    }
}

impl From<lopdf::Error> for ContractError {
    fn from(err: lopdf::Error) -> Self {
        ContractError::RenderingFailed(err.to_string())
    }
}

// Bare I/O errors only reach callers from record, asset and audit writes;
// rendering paths wrap their own.
impl From<std::io::Error> for ContractError {
    fn from(err: std::io::Error) -> Self {
        ContractError::StorageFailed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ContractError>;
