use std::collections::BTreeMap;

use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::device::{CryptoDevice, DeviceError};

use super::{ChoiceCode, DistrictId, Election, ElectionId};

/// Counts for one district.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistrictTally {
    pub choices: BTreeMap<ChoiceCode, u64>,
    /// Ballots that decrypted cleanly but named no legal choice.
    pub invalid_count: u64,
}

/// Running per-district, per-choice counts for one election.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabulationTally {
    pub districts: BTreeMap<DistrictId, DistrictTally>,
}

impl TabulationTally {
    /// Zero counts for every district and choice of the election.
    pub fn new(election: &Election) -> Self {
        let districts = election
            .districts
            .iter()
            .map(|(id, district)| {
                let choices = district
                    .choices
                    .iter()
                    .map(|choice| (choice.code.clone(), 0))
                    .collect();
                (
                    id.clone(),
                    DistrictTally {
                        choices,
                        invalid_count: 0,
                    },
                )
            })
            .collect();
        Self { districts }
    }

    pub fn count_valid(&mut self, district: &DistrictId, choice: &ChoiceCode) {
        let district = self.districts.entry(district.clone()).or_default();
        *district.choices.entry(choice.clone()).or_default() += 1;
    }

    pub fn count_invalid(&mut self, district: &DistrictId) {
        self.districts
            .entry(district.clone())
            .or_default()
            .invalid_count += 1;
    }

    /// Counts per choice code, summed over districts.
    pub fn totals(&self) -> BTreeMap<ChoiceCode, u64> {
        let mut totals = BTreeMap::new();
        for district in self.districts.values() {
            for (choice, count) in &district.choices {
                *totals.entry(choice.clone()).or_default() += count;
            }
        }
        totals
    }

    pub fn invalid_total(&self) -> u64 {
        self.districts.values().map(|d| d.invalid_count).sum()
    }

    pub fn valid_total(&self) -> u64 {
        self.districts
            .values()
            .flat_map(|d| d.choices.values())
            .sum()
    }
}

/// Line counts of the five tabulation audit logs of one election.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCounts {
    pub considered: usize,
    pub excluded: usize,
    pub forwarded: usize,
    pub rejected: usize,
    pub tallied: usize,
}

impl LogCounts {
    /// Every considered vote was either excluded or forwarded, and every
    /// forwarded ballot was either rejected or tallied.
    pub fn is_consistent(&self) -> bool {
        self.considered == self.excluded + self.forwarded
            && self.forwarded == self.rejected + self.tallied
    }

    /// Nothing has been written by a tabulation run yet.
    pub fn is_untouched(&self) -> bool {
        self.excluded == 0 && self.forwarded == 0 && self.rejected == 0 && self.tallied == 0
    }
}

/// The outcome of tabulating one election, before signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabulationResult {
    pub election_id: ElectionId,
    pub tally: TabulationTally,
    pub totals: BTreeMap<ChoiceCode, u64>,
    pub invalid_total: u64,
    pub log_counts: LogCounts,
}

impl TabulationResult {
    pub fn new(election_id: ElectionId, tally: TabulationTally, log_counts: LogCounts) -> Self {
        Self {
            election_id,
            totals: tally.totals(),
            invalid_total: tally.invalid_total(),
            tally,
            log_counts,
        }
    }

    /// Canonical byte form: JSON over ordered maps.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn hash(&self) -> Result<[u8; 32], serde_json::Error> {
        Ok(Sha256::digest(self.to_bytes()?).into())
    }
}

/// A result together with its hash and the crypto device's signature over
/// that hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedResult {
    pub result: TabulationResult,
    pub result_hash: String,
    pub signature: String,
}

impl SignedResult {
    /// Hash and sign a result on the crypto device.
    pub fn sign<D: CryptoDevice + ?Sized>(
        result: TabulationResult,
        device: &D,
    ) -> Result<Self, DeviceError> {
        let hash = result
            .hash()
            .map_err(|e| DeviceError::Signing(format!("cannot serialise result: {e}")))?;
        let signature = device.sign(&hash)?;
        Ok(Self {
            result,
            result_hash: HEXLOWER.encode(&hash),
            signature: HEXLOWER.encode(&signature),
        })
    }

    /// Does the stored hash match the result it accompanies?
    pub fn hash_matches(&self) -> bool {
        self.result
            .hash()
            .map(|hash| HEXLOWER.encode(&hash) == self.result_hash)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(s: &str) -> ChoiceCode {
        s.parse().unwrap()
    }

    fn district(s: &str) -> DistrictId {
        s.parse().unwrap()
    }

    #[test]
    fn new_tally_has_every_choice_at_zero() {
        let tally = TabulationTally::new(&Election::example1());
        assert_eq!(tally.districts.len(), 2);
        assert_eq!(tally.districts[&district("north")].choices[&code("101")], 0);
        assert_eq!(tally.valid_total(), 0);
        assert_eq!(tally.totals().len(), 4);
    }

    #[test]
    fn counting() {
        let mut tally = TabulationTally::new(&Election::example1());
        tally.count_valid(&district("north"), &code("101"));
        tally.count_valid(&district("north"), &code("101"));
        tally.count_valid(&district("south"), &code("202"));
        tally.count_invalid(&district("south"));

        assert_eq!(tally.totals()[&code("101")], 2);
        assert_eq!(tally.totals()[&code("202")], 1);
        assert_eq!(tally.valid_total(), 3);
        assert_eq!(tally.invalid_total(), 1);
    }

    #[test]
    fn log_count_invariants() {
        let counts = LogCounts {
            considered: 5,
            excluded: 2,
            forwarded: 3,
            rejected: 1,
            tallied: 2,
        };
        assert!(counts.is_consistent());
        assert!(!counts.is_untouched());
        assert!(!LogCounts {
            tallied: 1,
            ..counts
        }
        .is_consistent());
        assert!(LogCounts {
            considered: 4,
            ..Default::default()
        }
        .is_untouched());
    }

    #[test]
    fn hash_is_stable() {
        let result = TabulationResult::new(
            "parliament".parse().unwrap(),
            TabulationTally::new(&Election::example1()),
            LogCounts::default(),
        );
        assert_eq!(result.hash().unwrap(), result.clone().hash().unwrap());
    }
}
