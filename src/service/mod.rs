//! The request-level operations, one service per protocol.
//!
//! Every entry point takes the current [`ElectionPhase`](crate::ElectionPhase)
//! and refuses to run outside the phases it belongs to. Anything that
//! changes what is stored for a voter runs under that voter's exclusive
//! lock.

use crate::error::{Error, Result};
use crate::keys;
use crate::model::{DistrictId, Election, ElectionId, RecordId, TokenId, VerificationToken, VoteRecord, VoterId};
use crate::store::Store;

pub mod revocation;
pub mod setup;
pub mod submission;
pub mod tabulation;
pub mod verification;

pub use revocation::RevocationService;
pub use setup::SetupService;
pub use submission::SubmissionService;
pub use tabulation::{TabulationLedger, TabulationService};
pub use verification::{BallotForDisplay, BallotsForDisplay, VerificationService};

/// Ids of every loaded election.
pub fn election_ids<S: Store>(store: &S) -> Result<Vec<ElectionId>> {
    let mut ids = Vec::new();
    for name in store.children(&keys::elections())? {
        let id: ElectionId = name
            .parse()
            .map_err(|e| Error::InconsistentState(format!("stray election entry: {e}")))?;
        if store.exists(&keys::election_definition(&id))? {
            ids.push(id);
        }
    }
    Ok(ids)
}

pub fn load_election<S: Store>(store: &S, id: &ElectionId) -> Result<Election> {
    store
        .get_json(&keys::election_definition(id))?
        .ok_or_else(|| Error::UnknownElection(id.clone()))
}

/// The district `voter` votes in for `election`, if eligible.
pub fn voter_district<S: Store>(
    store: &S,
    election: &ElectionId,
    voter: &VoterId,
) -> Result<Option<DistrictId>> {
    Ok(store.get_json(&keys::eligibility(election, voter))?)
}

/// Ids of a voter's stored records, oldest first.
pub fn record_ids<S: Store>(store: &S, voter: &VoterId) -> Result<Vec<RecordId>> {
    store
        .children(&keys::voter_records(voter))?
        .into_iter()
        .map(|name| {
            name.parse()
                .map_err(|e| Error::InconsistentState(format!("stray record of {voter}: {e}")))
        })
        .collect()
}

/// A voter's stored records, oldest first.
pub fn voter_records<S: Store>(store: &S, voter: &VoterId) -> Result<Vec<VoteRecord>> {
    record_ids(store, voter)?
        .iter()
        .map(|id| {
            store
                .get_json(&keys::vote_record(voter, id))?
                .ok_or_else(|| Error::InconsistentState(format!("record {id} of {voter} vanished")))
        })
        .collect()
}

/// Every voter that has at least one stored record.
pub fn voters_with_records<S: Store>(store: &S) -> Result<Vec<VoterId>> {
    store
        .children(&keys::voters())?
        .into_iter()
        .map(|name| {
            name.parse()
                .map_err(|e| Error::InconsistentState(format!("stray voter entry: {e}")))
        })
        .collect()
}

pub fn latest_record<S: Store>(store: &S, voter: &VoterId) -> Result<Option<VoteRecord>> {
    match record_ids(store, voter)?.last() {
        Some(id) => Ok(Some(
            store
                .get_json(&keys::vote_record(voter, id))?
                .ok_or_else(|| Error::InconsistentState(format!("record {id} of {voter} vanished")))?,
        )),
        None => Ok(None),
    }
}

/// The vote that would be counted for `voter` right now: the newest record,
/// unless the voter's vote is revoked.
pub fn active_vote<S: Store>(store: &S, voter: &VoterId) -> Result<Option<VoteRecord>> {
    if store.exists(&keys::revocation_mark(voter))? {
        return Ok(None);
    }
    latest_record(store, voter)
}

/// Delete a token and then its backreferences, so that a crash in between
/// leaves only dangling backreferences, which lead nowhere.
pub fn drop_token<S: Store>(store: &S, token: &VerificationToken) -> Result<()> {
    store.remove(&keys::token(&token.token_id))?;
    for election in &token.bound_election_ids {
        store.remove(&keys::token_backref(election, &token.voter_id))?;
    }
    debug!("Dropped verification token of {}", token.voter_id);
    Ok(())
}

/// Remove whatever token `voter` may hold, following the backreferences of
/// every election. Must be called with the voter's lock held.
pub fn invalidate_voter_token<S: Store>(store: &S, voter: &VoterId) -> Result<bool> {
    let mut backrefs = Vec::new();
    let mut tokens = Vec::new();
    for election in election_ids(store)? {
        let key = keys::token_backref(&election, voter);
        if let Some(token) = store.get_json::<TokenId>(&key)? {
            if !tokens.contains(&token) {
                tokens.push(token);
            }
            backrefs.push(key);
        }
    }
    for token in &tokens {
        store.remove(&keys::token(token))?;
    }
    for key in &backrefs {
        store.remove(key)?;
    }
    if !tokens.is_empty() {
        debug!("Invalidated verification token of {voter}");
    }
    Ok(!tokens.is_empty())
}
