//! Signature and certificate validation of incoming envelopes.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod registry;

pub use registry::{seal_envelope, Certificate, CertificateRegistry, RegistryError};

/// What a signer must be certified for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Voter,
    RevocationOperator,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Voter => "voter",
            Self::RevocationOperator => "revocation operator",
        })
    }
}

/// Signed bytes as received, not yet validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEnvelope(pub Vec<u8>);

/// An envelope whose signature and certificate have been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedEnvelope {
    /// Subject of the signing certificate.
    pub signer: String,
    /// Signing time vouched for by the oracle.
    pub signed_at: DateTime<Utc>,
    pub content: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrustError {
    #[error("{0}")]
    SignatureInvalid(String),
    #[error("{0}")]
    CertificateRevokedOrExpired(String),
    #[error("{subject} is not certified as {role}")]
    Unauthorized { subject: String, role: Role },
}

/// Validates envelopes: signature, certificate chain, revocation status and
/// role. Production deployments plug in their PKI here.
pub trait TrustOracle {
    fn verify(
        &self,
        envelope: &SignedEnvelope,
        role: Role,
    ) -> Result<VerifiedEnvelope, TrustError>;
}
