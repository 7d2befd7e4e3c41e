use chrono::{DateTime, Utc};
use rand::seq::IteratorRandom;
use serde::Serialize;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::keys;
use crate::model::{
    Choice, DistrictId, ElectionId, TokenId, VerificationToken, VoteRecord, VoterId,
};
use crate::phase::ElectionPhase;
use crate::service::{active_vote, drop_token, load_election, voter_district};
use crate::store::Store;

/// One stored ballot together with what the voter's device needs to decrypt
/// and display it locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BallotForDisplay {
    pub election_id: ElectionId,
    pub election_name: String,
    pub district_id: DistrictId,
    #[serde(with = "crate::model::serde_base64")]
    pub ciphertext: Vec<u8>,
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BallotsForDisplay {
    pub voter_id: VoterId,
    pub submitted_at: DateTime<Utc>,
    pub ballots: Vec<BallotForDisplay>,
}

/// Serves stored ballots back to voters through the independent
/// verification channel. Never decrypts anything.
pub struct VerificationService<'a, S> {
    store: &'a S,
    config: &'a Config,
}

impl<'a, S: Store> VerificationService<'a, S> {
    pub fn new(store: &'a S, config: &'a Config) -> Self {
        Self { store, config }
    }

    pub fn verify(&self, phase: ElectionPhase, token: &str) -> Result<BallotsForDisplay> {
        phase.require(
            "verification",
            &[ElectionPhase::Voting, ElectionPhase::Revocation],
        )?;
        let token_id: TokenId = token.parse().map_err(|e| {
            info!("Verification with malformed token: {e}");
            Error::TokenUnknown
        })?;
        let voter = match self.store.get_json::<VerificationToken>(&keys::token(&token_id))? {
            Some(token) => token.voter_id,
            None => {
                info!("Verification with unknown token");
                return Err(Error::TokenUnknown);
            }
        };

        let _lock = self.store.lock_exclusive(&keys::voter_lock(&voter))?;
        // Another request may have used up or replaced the token meanwhile.
        let mut token: VerificationToken = self
            .store
            .get_json(&keys::token(&token_id))?
            .ok_or(Error::TokenUnknown)?;

        if token.is_expired(Utc::now(), self.config.verification_timeout()) {
            info!("Verification token of {voter} expired");
            drop_token(self.store, &token)?;
            return Err(Error::TokenExpired);
        }
        if token.is_exhausted() {
            warn!("Verification token of {voter} stored with no uses left");
            drop_token(self.store, &token)?;
            return Err(Error::TokenExhausted);
        }

        let record = self.check_binding(&token)?;

        token.remaining_uses -= 1;
        if token.is_exhausted() {
            drop_token(self.store, &token)?;
        } else {
            self.store.replace_json(&keys::token(&token_id), &token)?;
        }

        let mut ballots = Vec::with_capacity(record.ballots.len());
        for ballot in record.ballots {
            let election = load_election(self.store, &ballot.election_id)?;
            let district_id = voter_district(self.store, &election.id, &voter)?.ok_or_else(|| {
                Error::InconsistentState(format!("{voter} voted in {} without eligibility", election.id))
            })?;
            let district = election.district(&district_id).ok_or_else(|| {
                Error::InconsistentState(format!("{} has no district {district_id}", election.id))
            })?;
            ballots.push(BallotForDisplay {
                election_id: ballot.election_id,
                election_name: election.name.clone(),
                choices: district.choices.clone(),
                district_id,
                ciphertext: ballot.ciphertext,
            });
        }

        info!(
            "Verified vote of {voter}, {} use(s) left",
            token.remaining_uses
        );
        Ok(BallotsForDisplay {
            voter_id: voter,
            submitted_at: record.submitted_at,
            ballots,
        })
    }

    /// Confirm that the token still describes the voter's active vote,
    /// spot-checking one randomly chosen backreference.
    fn check_binding(&self, token: &VerificationToken) -> Result<VoteRecord> {
        let voter = &token.voter_id;
        let election = token
            .bound_election_ids
            .iter()
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| inconsistent(format!("token of {voter} is bound to no election")))?;

        let backref = self
            .store
            .get_json::<TokenId>(&keys::token_backref(election, voter))?;
        if backref.as_ref() != Some(&token.token_id) {
            return Err(inconsistent(format!(
                "backreference of {voter} in {election} does not point at the presented token"
            )));
        }

        let record = active_vote(self.store, voter)?
            .ok_or_else(|| inconsistent(format!("token of {voter} outlived their active vote")))?;
        if record.record_id != token.record_id {
            return Err(inconsistent(format!(
                "token of {voter} was issued for {}, active vote is {}",
                token.record_id, record.record_id
            )));
        }
        if record.election_ids() != token.bound_election_ids {
            return Err(inconsistent(format!(
                "token of {voter} is bound to other elections than record {}",
                record.record_id
            )));
        }
        Ok(record)
    }
}

fn inconsistent(detail: String) -> Error {
    error!("Verification found inconsistent state: {detail}");
    Error::InconsistentState(detail)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::service::voter_records;
    use crate::test_support::Fixture;

    #[test]
    fn returns_every_bound_ballot_with_its_choices() {
        let fixture = Fixture::voting();
        let token = fixture
            .submit("v2", &[("parliament", "201"), ("referendum", "no")])
            .unwrap();
        let shown = fixture
            .verification()
            .verify(ElectionPhase::Voting, token.token_id.as_str())
            .unwrap();

        assert_eq!(shown.voter_id, fixture.voter("v2"));
        assert_eq!(shown.ballots.len(), 2);
        let parliament = &shown.ballots[0];
        assert_eq!(parliament.election_id.as_str(), "parliament");
        assert_eq!(parliament.district_id.as_str(), "south");
        let codes = parliament
            .choices
            .iter()
            .map(|c| c.code.as_str())
            .collect::<Vec<_>>();
        assert_eq!(codes, vec!["201", "202"]);

        // Exactly the ciphertext that was submitted.
        let stored = &voter_records(&fixture.store, &fixture.voter("v2")).unwrap()[0];
        assert_eq!(parliament.ciphertext, stored.ballots[0].ciphertext);
        assert_eq!(fixture.open(&parliament.ciphertext), "parliament:201");
    }

    #[test]
    fn uses_run_out() {
        let fixture = Fixture::voting();
        let token = fixture.submit("v1", &[("parliament", "101")]).unwrap();
        let service = fixture.verification();
        for _ in 0..fixture.config.verification_max_uses() {
            service
                .verify(ElectionPhase::Voting, token.token_id.as_str())
                .unwrap();
        }
        assert!(matches!(
            service.verify(ElectionPhase::Voting, token.token_id.as_str()),
            Err(Error::TokenUnknown)
        ));
        assert!(!fixture
            .store
            .exists(&keys::token_backref(&"parliament".parse().unwrap(), &fixture.voter("v1")))
            .unwrap());
    }

    #[test]
    fn expired_tokens_are_deleted() {
        let fixture = Fixture::voting();
        let mut token = fixture.submit("v1", &[("parliament", "101")]).unwrap();
        token.issued_at = Utc::now() - fixture.config.verification_timeout() - Duration::seconds(1);
        fixture
            .store
            .replace_json(&keys::token(&token.token_id), &token)
            .unwrap();

        let service = fixture.verification();
        assert!(matches!(
            service.verify(ElectionPhase::Voting, token.token_id.as_str()),
            Err(Error::TokenExpired)
        ));
        assert!(matches!(
            service.verify(ElectionPhase::Voting, token.token_id.as_str()),
            Err(Error::TokenUnknown)
        ));
    }

    #[test]
    fn exhausted_tokens_are_refused() {
        let fixture = Fixture::voting();
        let mut token = fixture.submit("v1", &[("parliament", "101")]).unwrap();
        token.remaining_uses = 0;
        fixture
            .store
            .replace_json(&keys::token(&token.token_id), &token)
            .unwrap();
        assert!(matches!(
            fixture
                .verification()
                .verify(ElectionPhase::Voting, token.token_id.as_str()),
            Err(Error::TokenExhausted)
        ));
    }

    #[test]
    fn unknown_and_malformed_tokens() {
        let fixture = Fixture::voting();
        let service = fixture.verification();
        let random = TokenId::random().to_string();
        for token in ["", "xyz", "../../phase", random.as_str()] {
            assert!(matches!(
                service.verify(ElectionPhase::Voting, token),
                Err(Error::TokenUnknown)
            ));
        }
    }

    #[test]
    fn superseded_token_no_longer_verifies() {
        let fixture = Fixture::voting();
        let first = fixture.submit("v1", &[("parliament", "101")]).unwrap();
        let second = fixture.submit("v1", &[("parliament", "102")]).unwrap();
        let service = fixture.verification();
        assert!(matches!(
            service.verify(ElectionPhase::Voting, first.token_id.as_str()),
            Err(Error::TokenUnknown)
        ));
        let shown = service
            .verify(ElectionPhase::Voting, second.token_id.as_str())
            .unwrap();
        assert_eq!(fixture.open(&shown.ballots[0].ciphertext), "parliament:102");
    }

    #[test]
    fn record_without_fresh_token_is_inconsistent() {
        let fixture = Fixture::voting();
        let token = fixture.submit("v1", &[("parliament", "101")]).unwrap();

        // A crash after storing a newer record but before reissuing the token.
        let mut newer = voter_records(&fixture.store, &fixture.voter("v1")).unwrap()[0].clone();
        newer.submitted_at = newer.submitted_at + Duration::seconds(1);
        newer.regenerate_id();
        fixture
            .store
            .create_json(&keys::vote_record(&newer.voter_id, &newer.record_id), &newer)
            .unwrap();

        let err = fixture
            .verification()
            .verify(ElectionPhase::Voting, token.token_id.as_str())
            .unwrap_err();
        assert!(matches!(err, Error::InconsistentState(_)));
        assert_eq!(err.response().message, "internal error");
    }

    #[test]
    fn foreign_backreference_is_inconsistent() {
        let fixture = Fixture::voting();
        let token = fixture.submit("v1", &[("parliament", "101")]).unwrap();
        fixture
            .store
            .replace_json(
                &keys::token_backref(&"parliament".parse().unwrap(), &fixture.voter("v1")),
                &TokenId::random(),
            )
            .unwrap();
        assert!(matches!(
            fixture
                .verification()
                .verify(ElectionPhase::Voting, token.token_id.as_str()),
            Err(Error::InconsistentState(_))
        ));
    }

    #[test]
    fn not_offered_outside_voting_and_revocation() {
        let fixture = Fixture::voting();
        let token = fixture.submit("v1", &[("parliament", "101")]).unwrap();
        let service = fixture.verification();
        for phase in [ElectionPhase::Setup, ElectionPhase::Tabulation] {
            assert!(matches!(
                service.verify(phase, token.token_id.as_str()),
                Err(Error::WrongPhase { .. })
            ));
        }
        assert!(service
            .verify(ElectionPhase::Revocation, token.token_id.as_str())
            .is_ok());
    }
}
