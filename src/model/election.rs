use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::{ChoiceCode, DistrictId, ElectionId, VoterId};

/// One election as loaded during setup: its districts and the choices legal
/// in each of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Election {
    pub id: ElectionId,
    /// Human-readable name.
    pub name: String,
    pub districts: BTreeMap<DistrictId, District>,
}

impl Election {
    pub fn district(&self, id: &DistrictId) -> Option<&District> {
        self.districts.get(id)
    }

    /// Check internal consistency, returning a description of the first
    /// problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.districts.is_empty() {
            return Err(format!("election {} has no districts", self.id));
        }
        for (id, district) in &self.districts {
            if district.choices.is_empty() {
                return Err(format!("district {id} of {} has no choices", self.id));
            }
            let mut seen = HashSet::new();
            for choice in &district.choices {
                if !seen.insert(&choice.code) {
                    return Err(format!(
                        "district {id} of {} lists choice {} twice",
                        self.id, choice.code
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct District {
    pub name: String,
    /// Choices in ballot order.
    pub choices: Vec<Choice>,
}

impl District {
    pub fn choice(&self, code: &ChoiceCode) -> Option<&Choice> {
        self.choices.iter().find(|c| &c.code == code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub code: ChoiceCode,
    /// What the voter's device displays for this choice.
    pub label: String,
}

/// An eligibility list for one election, as delivered for loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterList {
    pub election_id: ElectionId,
    pub voters: Vec<EligibilityEntry>,
}

/// A single eligible voter and the district they vote in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityEntry {
    pub voter_id: VoterId,
    pub district_id: DistrictId,
}

/// Example test data.
#[cfg(test)]
pub(crate) mod examples {
    use super::*;

    fn choices(codes: &[(&str, &str)]) -> Vec<Choice> {
        codes
            .iter()
            .map(|(code, label)| Choice {
                code: code.parse().unwrap(),
                label: label.to_string(),
            })
            .collect()
    }

    impl Election {
        /// A two-district election with district-specific candidates.
        pub fn example1() -> Self {
            let mut districts = BTreeMap::new();
            districts.insert(
                "north".parse().unwrap(),
                District {
                    name: "Northern district".to_string(),
                    choices: choices(&[("101", "Chris Riches"), ("102", "Parry Hotter")]),
                },
            );
            districts.insert(
                "south".parse().unwrap(),
                District {
                    name: "Southern district".to_string(),
                    choices: choices(&[("201", "Alice Ashby"), ("202", "Bob Barker")]),
                },
            );
            Self {
                id: "parliament".parse().unwrap(),
                name: "Parliamentary election".to_string(),
                districts,
            }
        }

        /// A single-district yes/no question.
        pub fn example2() -> Self {
            let mut districts = BTreeMap::new();
            districts.insert(
                "all".parse().unwrap(),
                District {
                    name: "Whole country".to_string(),
                    choices: choices(&[("yes", "Yes"), ("no", "No")]),
                },
            );
            Self {
                id: "referendum".parse().unwrap(),
                name: "Referendum".to_string(),
                districts,
            }
        }
    }

    impl VoterList {
        /// `v1` and `v3` vote in the north, `v2` in the south.
        pub fn example1() -> Self {
            Self::of("parliament", &[("v1", "north"), ("v2", "south"), ("v3", "north")])
        }

        /// Every example voter may vote in the referendum.
        pub fn example2() -> Self {
            Self::of("referendum", &[("v1", "all"), ("v2", "all"), ("v3", "all")])
        }

        pub fn of(election: &str, voters: &[(&str, &str)]) -> Self {
            Self {
                election_id: election.parse().unwrap(),
                voters: voters
                    .iter()
                    .map(|(voter, district)| EligibilityEntry {
                        voter_id: voter.parse().unwrap(),
                        district_id: district.parse().unwrap(),
                    })
                    .collect(),
            }
        }
    }
}
