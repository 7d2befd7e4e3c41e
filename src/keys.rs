//! Where everything lives in the store.
//!
//! ```text
//! phase                                  current ElectionPhase
//! maintenance                            present while submission is disabled
//! lists/hash                             hash of all loaded eligibility lists
//! lists/agreed                           last list hash the relay confirmed
//! elections/<election>/definition        Election
//! elections/<election>/voters/<voter>    district of an eligible voter
//! elections/<election>/tokens/<voter>    backreference to the voter's token
//! votes/<voter>/<record>                 VoteRecord, never overwritten
//! revoked/<voter>                        RevocationMark
//! tokens/<token>                         VerificationToken
//! logs/<election>/{l1..l5,revocations}   append-only audit logs
//! results/<election>                     SignedResult
//! ```
//!
//! Locks live in their own namespace: `voters/<voter>` serialises every
//! mutation touching one voter, `tabulation/<election>` serialises
//! tabulation runs and `phase` serialises phase transitions.

use crate::audit::LogKind;
use crate::model::{ElectionId, RecordId, TokenId, VoterId};
use crate::store::Key;

pub fn phase() -> Key {
    Key::trusted(["phase"])
}

pub fn maintenance() -> Key {
    Key::trusted(["maintenance"])
}

pub fn list_hash() -> Key {
    Key::trusted(["lists", "hash"])
}

pub fn agreed_list_hash() -> Key {
    Key::trusted(["lists", "agreed"])
}

pub fn elections() -> Key {
    Key::trusted(["elections"])
}

pub fn election_definition(election: &ElectionId) -> Key {
    Key::trusted(["elections", election.as_str(), "definition"])
}

pub fn eligibility_list(election: &ElectionId) -> Key {
    Key::trusted(["elections", election.as_str(), "voters"])
}

pub fn eligibility(election: &ElectionId, voter: &VoterId) -> Key {
    Key::trusted(["elections", election.as_str(), "voters", voter.as_str()])
}

pub fn token_backref(election: &ElectionId, voter: &VoterId) -> Key {
    Key::trusted(["elections", election.as_str(), "tokens", voter.as_str()])
}

pub fn voters() -> Key {
    Key::trusted(["votes"])
}

pub fn voter_records(voter: &VoterId) -> Key {
    Key::trusted(["votes", voter.as_str()])
}

pub fn vote_record(voter: &VoterId, record: &RecordId) -> Key {
    Key::trusted(["votes", voter.as_str(), record.as_str()])
}

pub fn revocation_mark(voter: &VoterId) -> Key {
    Key::trusted(["revoked", voter.as_str()])
}

pub fn tokens() -> Key {
    Key::trusted(["tokens"])
}

pub fn token(token: &TokenId) -> Key {
    Key::trusted(["tokens", token.as_str()])
}

pub fn audit_log(election: &ElectionId, kind: LogKind) -> Key {
    Key::trusted(["logs", election.as_str(), kind.file_name()])
}

pub fn result(election: &ElectionId) -> Key {
    Key::trusted(["results", election.as_str()])
}

/// Lock serialising all mutations for one voter.
pub fn voter_lock(voter: &VoterId) -> Key {
    Key::trusted(["voters", voter.as_str()])
}

/// Lock serialising tabulation runs of one election.
pub fn tabulation_lock(election: &ElectionId) -> Key {
    Key::trusted(["tabulation", election.as_str()])
}

/// Lock serialising phase transitions.
pub fn phase_lock() -> Key {
    Key::trusted(["phase"])
}
