use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{RecordId, VoterId};

/// Whether a petition batch voids or reinstates votes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PetitionMode {
    Revoke,
    Restore,
}

impl Display for PetitionMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Revoke => "revoke",
            Self::Restore => "restore",
        })
    }
}

/// One entry of a petition batch. The personal id is kept as given so that
/// a malformed one is rejected on its own rather than failing the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Petition {
    pub personal_id: String,
    pub name: String,
    pub reason: String,
}

/// The signed content of a revocation or restoration batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PetitionBatch {
    pub mode: PetitionMode,
    pub entries: Vec<Petition>,
}

/// Marks a voter's vote as not to be counted. Removed again on restoration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationMark {
    pub voter_id: VoterId,
    pub marked_at: DateTime<Utc>,
    pub reason: String,
    pub operator_id: String,
    /// The record that was the voter's active vote when marked.
    pub record_id: RecordId,
}

/// A petition that could not be applied, with the reason why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedPetition {
    pub petition: Petition,
    pub reason: String,
}

/// Per-entry outcome of applying a petition batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub operator_id: String,
    pub mode: PetitionMode,
    pub processed_at: DateTime<Utc>,
    pub accepted: Vec<Petition>,
    pub rejected: Vec<RejectedPetition>,
}

impl BatchReport {
    pub fn new(operator_id: &str, mode: PetitionMode) -> Self {
        Self {
            operator_id: operator_id.to_string(),
            mode,
            processed_at: Utc::now(),
            accepted: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

/// The human-readable report handed back to the operator.
impl Display for BatchReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Petition batch ({}) applied by {} at {}",
            self.mode,
            self.operator_id,
            self.processed_at.to_rfc3339()
        )?;
        writeln!(
            f,
            "{} accepted, {} rejected",
            self.accepted.len(),
            self.rejected.len()
        )?;
        for petition in &self.accepted {
            writeln!(f, "  OK    {}\t{}", petition.personal_id, petition.name)?;
        }
        for rejected in &self.rejected {
            writeln!(
                f,
                "  FAIL  {}\t{}\t{}",
                rejected.petition.personal_id, rejected.petition.name, rejected.reason
            )?;
        }
        Ok(())
    }
}
