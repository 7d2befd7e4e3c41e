use serde::Serialize;
use thiserror::Error;

use crate::device::DeviceError;
use crate::model::{ElectionId, VoterId};
use crate::phase::ElectionPhase;
use crate::store::StoreError;
use crate::trust::TrustError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{operation} is not permitted in phase {actual}")]
    WrongPhase {
        operation: &'static str,
        actual: ElectionPhase,
    },
    #[error("submission disabled: eligibility lists are out of sync with the relay")]
    Maintenance,
    #[error("invalid signature: {0}")]
    SignatureInvalid(String),
    #[error("certificate revoked or expired: {0}")]
    CertificateRevokedOrExpired(String),
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("voter {voter} is not eligible in election {election}")]
    NotEligible { voter: VoterId, election: ElectionId },
    #[error("voter {voter} has reached the limit of {limit} submissions")]
    QuotaExceeded { voter: VoterId, limit: u32 },
    #[error("unknown verification token")]
    TokenUnknown,
    #[error("verification token expired")]
    TokenExpired,
    #[error("verification token has no uses left")]
    TokenExhausted,
    #[error("inconsistent state: {0}")]
    InconsistentState(String),
    #[error("no vote recorded for {0}")]
    NotAVoter(String),
    #[error("vote of {0} is already revoked")]
    AlreadyRevoked(VoterId),
    #[error("vote of {0} is not revoked")]
    NotRevoked(VoterId),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ballot content: {0}")]
    InvalidBallotContent(String),
    #[error("unknown election {0}")]
    UnknownElection(ElectionId),
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),
    #[error(transparent)]
    StorageFailure(#[from] StoreError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl From<TrustError> for Error {
    fn from(err: TrustError) -> Self {
        match err {
            TrustError::CertificateRevokedOrExpired(msg) => Self::CertificateRevokedOrExpired(msg),
            other => Self::SignatureInvalid(other.to_string()),
        }
    }
}

impl Error {
    /// Errors that must abort the current request and halt tabulation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StorageFailure(_) | Self::InconsistentState(_) | Self::Device(_)
        )
    }

    /// The coarse, caller-facing view of this error.
    /// Detail stays in the log; in particular, no token failure reveals why.
    pub fn response(&self) -> Response {
        let (category, message) = match self {
            Self::WrongPhase { .. } | Self::Maintenance => {
                (Category::Unavailable, "operation not available")
            }
            Self::SignatureInvalid(_) => (Category::Unauthorized, "signature not accepted"),
            Self::CertificateRevokedOrExpired(_) => {
                (Category::Unauthorized, "certificate not valid")
            }
            Self::MalformedEnvelope(_) | Self::InvalidDefinition(_) | Self::UnknownElection(_) => {
                (Category::BadRequest, "malformed request")
            }
            Self::NotEligible { .. } => (Category::Forbidden, "not eligible"),
            Self::QuotaExceeded { .. } => (Category::Forbidden, "submission limit reached"),
            Self::TokenUnknown | Self::TokenExpired | Self::TokenExhausted => {
                (Category::Verification, "verification failed")
            }
            Self::NotAVoter(_) => (Category::Rejected, "no vote recorded"),
            Self::AlreadyRevoked(_) => (Category::Rejected, "already revoked"),
            Self::NotRevoked(_) => (Category::Rejected, "not revoked"),
            Self::InconsistentState(_)
            | Self::DecryptionFailed(_)
            | Self::InvalidBallotContent(_)
            | Self::StorageFailure(_)
            | Self::Device(_) => (Category::Internal, "internal error"),
        };
        Response { category, message }
    }
}

/// Broad classes of failure exposed to callers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Unavailable,
    Unauthorized,
    BadRequest,
    Forbidden,
    Verification,
    Rejected,
    Internal,
}

/// What a caller gets to see when a request fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
    pub category: Category,
    pub message: &'static str,
}
