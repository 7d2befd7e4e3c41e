//! Data model shared by all services.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::is_valid_segment;

pub mod election;
pub mod revocation;
pub mod tally;
pub mod token;
pub mod vote;

pub use election::{Choice, District, Election, EligibilityEntry, VoterList};
pub use revocation::{
    BatchReport, Petition, PetitionBatch, PetitionMode, RejectedPetition, RevocationMark,
};
pub use tally::{DistrictTally, LogCounts, SignedResult, TabulationResult, TabulationTally};
pub use token::{TokenId, VerificationToken};
pub use vote::{BallotBundle, EncryptedBallot, VoteRecord};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{kind} {value:?} must be 1-128 characters of [A-Za-z0-9._-], not starting with '.'")]
pub struct InvalidId {
    kind: &'static str,
    value: String,
}

/// Define a string identifier that is always usable as a store key segment.
macro_rules! segment_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = InvalidId;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                if is_valid_segment(&value) {
                    Ok(Self(value))
                } else {
                    Err(InvalidId { kind: $kind, value })
                }
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl FromStr for $name {
            type Err = InvalidId;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::try_from(s.to_string())
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

segment_id!(
    /// A voter's personal identification code.
    VoterId,
    "voter id"
);
segment_id!(
    /// Identifier of one election (contest) run by this instance.
    ElectionId,
    "election id"
);
segment_id!(
    /// Identifier of a voting district within an election.
    DistrictId,
    "district id"
);
segment_id!(
    /// Code of a single choice (candidate, party, answer) on a ballot.
    ChoiceCode,
    "choice code"
);
segment_id!(
    /// Identifier of one stored vote record, unique per voter. Lexical order
    /// of record ids is submission order.
    RecordId,
    "record id"
);

/// (De)serialisation of byte strings as standard base64.
pub(crate) mod serde_base64 {
    use data_encoding::BASE64;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| D::Error::custom(format!("invalid base64: {e}")))
    }
}
