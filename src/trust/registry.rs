//! A [`TrustOracle`] backed by a flat registry of Ed25519 certificates.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use data_encoding::{BASE64, HEXLOWER};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Role, SignedEnvelope, TrustError, TrustOracle, VerifiedEnvelope};

/// How far in the future a signing time may lie before it is refused.
const MAX_CLOCK_SKEW_SECONDS: i64 = 300;

/// A signer's certificate as held in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub subject: String,
    pub roles: BTreeSet<Role>,
    /// Hex Ed25519 public key.
    pub public_key: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    #[serde(default)]
    pub revoked: bool,
}

impl Certificate {
    /// Validity status at `at`, as an OCSP responder would report it.
    fn check_status(&self, at: DateTime<Utc>) -> Result<(), TrustError> {
        if self.revoked {
            return Err(TrustError::CertificateRevokedOrExpired(format!(
                "certificate of {} is revoked",
                self.subject
            )));
        }
        if at < self.not_before || at > self.not_after {
            return Err(TrustError::CertificateRevokedOrExpired(format!(
                "certificate of {} is not valid at {}",
                self.subject,
                at.to_rfc3339()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot read certificate registry: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed certificate registry: {0}")]
    Format(#[from] serde_json::Error),
    #[error("certificate of {0} has an unusable public key")]
    InvalidKey(String),
    #[error("public key of {0} is registered twice")]
    Duplicate(String),
}

/// Envelope as it travels: content plus detached signature.
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    /// Base64 content.
    content: String,
    /// Hex public key of the signer.
    signer: String,
    signed_at: DateTime<Utc>,
    /// Hex signature over [`signed_message`].
    signature: String,
}

/// The bytes actually signed: the content bound to its signing time.
fn signed_message(content: &[u8], signed_at: &DateTime<Utc>) -> Vec<u8> {
    let mut message = content.to_vec();
    message.push(b'\n');
    message.extend_from_slice(signed_at.to_rfc3339().as_bytes());
    message
}

/// Sign `content` as of `signed_at`, producing an envelope this registry
/// accepts for whichever subject owns `key`.
pub fn seal_envelope(key: &SigningKey, content: &[u8], signed_at: DateTime<Utc>) -> SignedEnvelope {
    let signature = key.sign(&signed_message(content, &signed_at));
    let wire = WireEnvelope {
        content: BASE64.encode(content),
        signer: HEXLOWER.encode(key.verifying_key().as_bytes()),
        signed_at,
        signature: HEXLOWER.encode(&signature.to_bytes()),
    };
    // Serialising plain strings and a timestamp cannot fail.
    SignedEnvelope(serde_json::to_vec(&wire).unwrap_or_default())
}

/// Certificates indexed by public key.
#[derive(Debug, Default)]
pub struct CertificateRegistry {
    certificates: BTreeMap<[u8; 32], (Certificate, VerifyingKey)>,
}

impl CertificateRegistry {
    pub fn new(certificates: Vec<Certificate>) -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        for certificate in certificates {
            let bytes: [u8; 32] = HEXLOWER
                .decode(certificate.public_key.as_bytes())
                .ok()
                .and_then(|bytes| bytes.try_into().ok())
                .ok_or_else(|| RegistryError::InvalidKey(certificate.subject.clone()))?;
            let key = VerifyingKey::from_bytes(&bytes)
                .map_err(|_| RegistryError::InvalidKey(certificate.subject.clone()))?;
            if registry.certificates.contains_key(&bytes) {
                return Err(RegistryError::Duplicate(certificate.subject));
            }
            registry.certificates.insert(bytes, (certificate, key));
        }
        Ok(registry)
    }

    /// Load a JSON array of certificates.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let reader = BufReader::new(File::open(path)?);
        let certificates: Vec<Certificate> = serde_json::from_reader(reader)?;
        let registry = Self::new(certificates)?;
        info!("Loaded {} certificates", registry.certificates.len());
        Ok(registry)
    }

    fn decode(envelope: &SignedEnvelope) -> Result<(WireEnvelope, Vec<u8>, [u8; 32], Signature), TrustError> {
        let malformed = |what: &str| TrustError::SignatureInvalid(format!("malformed envelope: {what}"));
        let wire: WireEnvelope =
            serde_json::from_slice(&envelope.0).map_err(|_| malformed("not an envelope"))?;
        let content = BASE64
            .decode(wire.content.as_bytes())
            .map_err(|_| malformed("content"))?;
        let signer: [u8; 32] = HEXLOWER
            .decode(wire.signer.as_bytes())
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| malformed("signer"))?;
        let signature: [u8; 64] = HEXLOWER
            .decode(wire.signature.as_bytes())
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| malformed("signature"))?;
        Ok((wire, content, signer, Signature::from_bytes(&signature)))
    }
}

impl TrustOracle for CertificateRegistry {
    fn verify(
        &self,
        envelope: &SignedEnvelope,
        role: Role,
    ) -> Result<VerifiedEnvelope, TrustError> {
        let (wire, content, signer, signature) = Self::decode(envelope)?;
        let (certificate, key) = self
            .certificates
            .get(&signer)
            .ok_or_else(|| TrustError::SignatureInvalid("unknown signer".to_string()))?;

        key.verify(&signed_message(&content, &wire.signed_at), &signature)
            .map_err(|_| {
                TrustError::SignatureInvalid(format!(
                    "signature of {} does not verify",
                    certificate.subject
                ))
            })?;

        let now = Utc::now();
        if wire.signed_at > now + Duration::seconds(MAX_CLOCK_SKEW_SECONDS) {
            return Err(TrustError::SignatureInvalid(format!(
                "signing time {} lies in the future",
                wire.signed_at.to_rfc3339()
            )));
        }
        certificate.check_status(wire.signed_at)?;
        certificate.check_status(now)?;

        if !certificate.roles.contains(&role) {
            return Err(TrustError::Unauthorized {
                subject: certificate.subject.clone(),
                role,
            });
        }
        debug!("Verified envelope from {} as {role}", certificate.subject);
        Ok(VerifiedEnvelope {
            signer: certificate.subject.clone(),
            signed_at: wire.signed_at,
            content,
        })
    }
}


#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;

    fn registry_with(cert: impl FnOnce(&SigningKey) -> Certificate) -> (SigningKey, CertificateRegistry) {
        let key = SigningKey::generate(&mut OsRng);
        let registry = CertificateRegistry::new(vec![cert(&key)]).unwrap();
        (key, registry)
    }

    #[test]
    fn accepts_well_signed_envelopes() {
        let (key, registry) = registry_with(|k| Certificate::example("v1", k, &[Role::Voter]));
        let signed_at = Utc::now();
        let envelope = seal_envelope(&key, b"ballots", signed_at);

        let verified = registry.verify(&envelope, Role::Voter).unwrap();
        assert_eq!(verified.signer, "v1");
        assert_eq!(verified.content, b"ballots");
        assert_eq!(verified.signed_at, signed_at);
    }

    #[test]
    fn rejects_tampered_content() {
        let (key, registry) = registry_with(|k| Certificate::example("v1", k, &[Role::Voter]));
        let envelope = seal_envelope(&key, b"ballots", Utc::now());
        let mut wire: WireEnvelope = serde_json::from_slice(&envelope.0).unwrap();
        wire.content = BASE64.encode(b"other ballots");
        let tampered = SignedEnvelope(serde_json::to_vec(&wire).unwrap());

        assert!(matches!(
            registry.verify(&tampered, Role::Voter),
            Err(TrustError::SignatureInvalid(_))
        ));
        assert!(matches!(
            registry.verify(&SignedEnvelope(b"garbage".to_vec()), Role::Voter),
            Err(TrustError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn rejects_unknown_signers() {
        let (_key, registry) = registry_with(|k| Certificate::example("v1", k, &[Role::Voter]));
        let stranger = SigningKey::generate(&mut OsRng);
        let envelope = seal_envelope(&stranger, b"ballots", Utc::now());
        assert!(matches!(
            registry.verify(&envelope, Role::Voter),
            Err(TrustError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn rejects_revoked_and_expired_certificates() {
        let (key, registry) = registry_with(|k| Certificate {
            revoked: true,
            ..Certificate::example("v1", k, &[Role::Voter])
        });
        let envelope = seal_envelope(&key, b"ballots", Utc::now());
        assert!(matches!(
            registry.verify(&envelope, Role::Voter),
            Err(TrustError::CertificateRevokedOrExpired(_))
        ));

        let (key, registry) = registry_with(|k| Certificate {
            not_after: Utc::now() - Duration::days(1),
            ..Certificate::example("v1", k, &[Role::Voter])
        });
        let envelope = seal_envelope(&key, b"ballots", Utc::now() - Duration::days(2));
        assert!(matches!(
            registry.verify(&envelope, Role::Voter),
            Err(TrustError::CertificateRevokedOrExpired(_))
        ));
    }

    #[test]
    fn enforces_roles() {
        let (key, registry) = registry_with(|k| Certificate::example("v1", k, &[Role::Voter]));
        let envelope = seal_envelope(&key, b"batch", Utc::now());
        assert_eq!(
            registry.verify(&envelope, Role::RevocationOperator),
            Err(TrustError::Unauthorized {
                subject: "v1".to_string(),
                role: Role::RevocationOperator
            })
        );
    }

    #[test]
    fn loads_from_file() {
        let key = SigningKey::generate(&mut OsRng);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let certs = vec![Certificate::example("operator-1", &key, &[Role::RevocationOperator])];
        std::fs::write(&path, serde_json::to_vec(&certs).unwrap()).unwrap();

        let registry = CertificateRegistry::from_file(&path).unwrap();
        let envelope = seal_envelope(&key, b"batch", Utc::now());
        assert_eq!(
            registry.verify(&envelope, Role::RevocationOperator).unwrap().signer,
            "operator-1"
        );

        let duplicate = vec![certs[0].clone(), certs[0].clone()];
        assert!(matches!(
            CertificateRegistry::new(duplicate),
            Err(RegistryError::Duplicate(_))
        ));
    }
}
