//! Append-only audit logs.
//!
//! Tabulation leaves five logs per election, each line one JSON object:
//!
//! * L1 every vote considered,
//! * L2 votes excluded before decryption (superseded or revoked),
//! * L3 votes forwarded for decryption,
//! * L4 decrypted ballots rejected as invalid,
//! * L5 ballots counted.
//!
//! A sixth log records every accepted revocation or restoration.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::keys;
use crate::model::{ChoiceCode, DistrictId, ElectionId, PetitionMode, RecordId, VoterId};
use crate::store::{Store, StoreError};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LogKind {
    Considered,
    Excluded,
    Forwarded,
    Rejected,
    Tallied,
    Revocations,
}

impl LogKind {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Considered => "l1",
            Self::Excluded => "l2",
            Self::Forwarded => "l3",
            Self::Rejected => "l4",
            Self::Tallied => "l5",
            Self::Revocations => "revocations",
        }
    }
}

/// A line type together with the log it belongs in.
pub trait AuditLine: Serialize + DeserializeOwned {
    const KIND: LogKind;
}

/// L1: a vote that tabulation has to account for. Written at submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsideredVote {
    pub voter_id: VoterId,
    pub record_id: RecordId,
    pub submitted_at: DateTime<Utc>,
}

impl AuditLine for ConsideredVote {
    const KIND: LogKind = LogKind::Considered;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    /// A newer vote of the same voter exists.
    Superseded,
    /// The voter's vote was revoked.
    Revoked,
}

/// L2
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedVote {
    pub voter_id: VoterId,
    pub record_id: RecordId,
    pub submitted_at: DateTime<Utc>,
    pub reason: ExclusionReason,
}

impl AuditLine for ExcludedVote {
    const KIND: LogKind = LogKind::Excluded;
}

/// L3
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedVote {
    pub voter_id: VoterId,
    pub record_id: RecordId,
    pub submitted_at: DateTime<Utc>,
    pub decided_at: DateTime<Utc>,
}

impl AuditLine for ForwardedVote {
    const KIND: LogKind = LogKind::Forwarded;
}

/// L4: identifies the ballot only by its ciphertext hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedBallot {
    pub ballot_hash: String,
    /// Present when the ballot counts as invalid in that district; absent
    /// when it could not be read as a ballot of this election at all.
    pub district_id: Option<DistrictId>,
    pub reason: String,
}

impl AuditLine for RejectedBallot {
    const KIND: LogKind = LogKind::Rejected;
}

/// L5: never carries anything that links back to the voter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TalliedBallot {
    pub district_id: DistrictId,
    pub choice: ChoiceCode,
}

impl AuditLine for TalliedBallot {
    const KIND: LogKind = LogKind::Tallied;
}

/// One accepted petition entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationEntry {
    pub voter_id: VoterId,
    pub mode: PetitionMode,
    pub operator_id: String,
    pub reason: String,
    pub record_id: RecordId,
    pub vote_submitted_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

impl AuditLine for RevocationEntry {
    const KIND: LogKind = LogKind::Revocations;
}

/// Typed access to one audit log of one election.
pub struct AuditLog<'a, S, L> {
    store: &'a S,
    election: &'a ElectionId,
    _line: PhantomData<L>,
}

impl<'a, S: Store, L: AuditLine> AuditLog<'a, S, L> {
    pub fn new(store: &'a S, election: &'a ElectionId) -> Self {
        Self {
            store,
            election,
            _line: PhantomData,
        }
    }

    fn key(&self) -> crate::store::Key {
        keys::audit_log(self.election, L::KIND)
    }

    pub fn append(&self, line: &L) -> Result<(), StoreError> {
        let key = self.key();
        let encoded = serde_json::to_string(line).map_err(|e| StoreError::codec(&key, e))?;
        self.store.append_line(&key, &encoded)
    }

    pub fn read(&self) -> Result<Vec<L>, StoreError> {
        let key = self.key();
        self.store
            .lines(&key)?
            .iter()
            .map(|line| serde_json::from_str(line).map_err(|e| StoreError::codec(&key, e)))
            .collect()
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        Ok(self.store.lines(&self.key())?.len())
    }

    /// Only ever used when rolling back an aborted tabulation.
    pub fn clear(&self) -> Result<bool, StoreError> {
        self.store.remove(&self.key())
    }
}
