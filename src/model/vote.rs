use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{ElectionId, RecordId, VoterId};

impl RecordId {
    /// A fresh record id for a vote received at `at`: a fixed-width UTC
    /// timestamp followed by a random suffix, so that lexical order is
    /// submission order with ties broken at random.
    pub fn generate(at: DateTime<Utc>) -> Self {
        let suffix = HEXLOWER.encode(&rand::random::<[u8; 4]>());
        Self(format!("{}-{suffix}", at.format("%Y%m%dT%H%M%S%.6fZ")))
    }
}

/// The content of a voter's signed envelope: one encrypted ballot per
/// election the voter is taking part in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotBundle {
    pub ballots: Vec<EncryptedBallot>,
}

impl BallotBundle {
    /// Decode and structurally check a bundle. Election ids must be distinct
    /// and every ballot non-empty; whether the elections exist is up to the
    /// caller.
    pub fn decode(content: &[u8]) -> Result<Self, String> {
        let bundle: Self =
            serde_json::from_slice(content).map_err(|e| format!("undecodable bundle: {e}"))?;
        if bundle.ballots.is_empty() {
            return Err("bundle holds no ballots".to_string());
        }
        let mut seen = BTreeSet::new();
        for ballot in &bundle.ballots {
            if ballot.ciphertext.is_empty() {
                return Err(format!("empty ballot for election {}", ballot.election_id));
            }
            if !seen.insert(&ballot.election_id) {
                return Err(format!("two ballots for election {}", ballot.election_id));
            }
        }
        Ok(bundle)
    }

    pub fn election_ids(&self) -> BTreeSet<ElectionId> {
        self.ballots.iter().map(|b| b.election_id.clone()).collect()
    }
}

/// A single still-encrypted ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBallot {
    pub election_id: ElectionId,
    #[serde(with = "crate::model::serde_base64")]
    pub ciphertext: Vec<u8>,
}

impl EncryptedBallot {
    /// Hex SHA-256 of the ciphertext, used to refer to a ballot in logs
    /// without naming its voter.
    pub fn hash(&self) -> String {
        HEXLOWER.encode(&Sha256::digest(&self.ciphertext))
    }
}

/// One accepted submission, written once and never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub voter_id: VoterId,
    pub record_id: RecordId,
    /// When this store accepted the vote. Orders a voter's submissions.
    pub submitted_at: DateTime<Utc>,
    /// The signing time vouched for by the trust oracle.
    pub signed_at: DateTime<Utc>,
    /// Hex SHA-256 of `raw_envelope`.
    pub envelope_hash: String,
    pub ballots: Vec<EncryptedBallot>,
    /// The envelope exactly as the voter signed it.
    #[serde(with = "crate::model::serde_base64")]
    pub raw_envelope: Vec<u8>,
}

impl VoteRecord {
    pub fn new(
        voter_id: VoterId,
        submitted_at: DateTime<Utc>,
        signed_at: DateTime<Utc>,
        bundle: BallotBundle,
        raw_envelope: Vec<u8>,
    ) -> Self {
        Self {
            voter_id,
            record_id: RecordId::generate(submitted_at),
            submitted_at,
            signed_at,
            envelope_hash: HEXLOWER.encode(&Sha256::digest(&raw_envelope)),
            ballots: bundle.ballots,
            raw_envelope,
        }
    }

    /// Pick a new random suffix after an id collision.
    pub fn regenerate_id(&mut self) {
        self.record_id = RecordId::generate(self.submitted_at);
    }

    pub fn election_ids(&self) -> BTreeSet<ElectionId> {
        self.ballots.iter().map(|b| b.election_id.clone()).collect()
    }

    pub fn ballot(&self, election: &ElectionId) -> Option<&EncryptedBallot> {
        self.ballots.iter().find(|b| &b.election_id == election)
    }

    pub fn covers(&self, election: &ElectionId) -> bool {
        self.ballot(election).is_some()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn bundle_json(ballots: &[(&str, &str)]) -> Vec<u8> {
        let ballots = ballots
            .iter()
            .map(|(election, ct)| serde_json::json!({"election_id": election, "ciphertext": ct}))
            .collect::<Vec<_>>();
        serde_json::to_vec(&serde_json::json!({ "ballots": ballots })).unwrap()
    }

    #[test]
    fn record_ids_sort_by_time() {
        let t1 = Utc.with_ymd_and_hms(2027, 3, 1, 9, 0, 0).unwrap();
        let t2 = t1 + Duration::microseconds(1);
        let a = RecordId::generate(t1);
        let b = RecordId::generate(t2);
        let c = RecordId::generate(t2 + Duration::days(400));
        assert!(a < b && b < c);
        assert!(a.as_str().starts_with("20270301T090000.000000Z-"));
        // Always a valid key segment.
        assert!(a.as_str().parse::<RecordId>().is_ok());
    }

    #[test]
    fn bundle_decoding() {
        let bundle = BallotBundle::decode(&bundle_json(&[("e1", "AAEC"), ("e2", "AwQ=")])).unwrap();
        assert_eq!(bundle.ballots.len(), 2);
        assert_eq!(bundle.ballots[0].ciphertext, vec![0, 1, 2]);

        assert!(BallotBundle::decode(b"not json").is_err());
        assert!(BallotBundle::decode(&bundle_json(&[])).is_err());
        assert!(BallotBundle::decode(&bundle_json(&[("e1", "")])).is_err());
        let duplicated = BallotBundle::decode(&bundle_json(&[("e1", "AAEC"), ("e1", "AwQ=")]));
        assert!(duplicated.unwrap_err().contains("two ballots"));
        assert!(BallotBundle::decode(&bundle_json(&[("../e1", "AAEC")])).is_err());
    }

    #[test]
    fn record_covers_its_elections() {
        let bundle = BallotBundle::decode(&bundle_json(&[("e1", "AAEC")])).unwrap();
        let now = Utc::now();
        let record = VoteRecord::new("v1".parse().unwrap(), now, now, bundle, b"raw".to_vec());
        assert!(record.covers(&"e1".parse().unwrap()));
        assert!(!record.covers(&"e2".parse().unwrap()));
        assert_eq!(record.envelope_hash.len(), 64);
    }
}
