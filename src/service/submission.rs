use chrono::Utc;

use crate::audit::{AuditLog, ConsideredVote};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::keys;
use crate::model::{BallotBundle, VerificationToken, VoteRecord, VoterId};
use crate::phase::ElectionPhase;
use crate::service::{invalidate_voter_token, record_ids, voter_district, SetupService};
use crate::store::{Store, StoreError};
use crate::trust::{Role, SignedEnvelope, TrustOracle};

/// Record ids carry a random suffix; colliding this often means something
/// else is wrong.
const MAX_ID_ATTEMPTS: usize = 8;

/// Accepts signed ballot bundles and stores them as vote records.
pub struct SubmissionService<'a, S, T: ?Sized> {
    store: &'a S,
    oracle: &'a T,
    config: &'a Config,
}

impl<'a, S: Store, T: TrustOracle + ?Sized> SubmissionService<'a, S, T> {
    pub fn new(store: &'a S, oracle: &'a T, config: &'a Config) -> Self {
        Self {
            store,
            oracle,
            config,
        }
    }

    /// Validate, store and acknowledge one submission. The returned token is
    /// the voter's only handle on the verification channel.
    pub fn submit(
        &self,
        phase: ElectionPhase,
        envelope: &SignedEnvelope,
    ) -> Result<VerificationToken> {
        phase.require("submission", &[ElectionPhase::Voting])?;
        if !SetupService::new(self.store).lists_agreed()? {
            warn!("Submission refused: eligibility lists not agreed with the relay");
            return Err(Error::Maintenance);
        }

        let verified = self.oracle.verify(envelope, Role::Voter).map_err(|e| {
            warn!("Submission refused by trust oracle: {e}");
            Error::from(e)
        })?;
        let voter: VoterId = verified.signer.parse().map_err(|e| {
            Error::SignatureInvalid(format!("certificate subject is not a voter id: {e}"))
        })?;
        let bundle = BallotBundle::decode(&verified.content).map_err(|e| {
            warn!("Malformed submission from {voter}: {e}");
            Error::MalformedEnvelope(e)
        })?;

        let elections = bundle.election_ids();
        for election in &elections {
            if !self.store.exists(&keys::election_definition(election))? {
                warn!("Submission from {voter} names unknown election {election}");
                return Err(Error::MalformedEnvelope(format!(
                    "unknown election {election}"
                )));
            }
        }
        for election in elections {
            if voter_district(self.store, &election, &voter)?.is_none() {
                warn!("Submission from {voter} for {election}, where they are not eligible");
                return Err(Error::NotEligible { voter, election });
            }
        }

        let _lock = self.store.lock_exclusive(&keys::voter_lock(&voter))?;

        let limit = self.config.max_submissions_per_voter();
        if record_ids(self.store, &voter)?.len() >= limit as usize {
            warn!("Submission from {voter} exceeds the limit of {limit}");
            return Err(Error::QuotaExceeded { voter, limit });
        }

        let mut record = VoteRecord::new(
            voter.clone(),
            Utc::now(),
            verified.signed_at,
            bundle,
            envelope.0.clone(),
        );
        self.store_record(&mut record)?;

        // The old token must not outlive the record it vouched for.
        invalidate_voter_token(self.store, &voter)?;

        let token = VerificationToken::issue(
            voter.clone(),
            record.record_id.clone(),
            record.election_ids(),
            self.config.verification_max_uses(),
        );
        self.store.create_json(&keys::token(&token.token_id), &token)?;
        for election in &token.bound_election_ids {
            self.store
                .replace_json(&keys::token_backref(election, &voter), &token.token_id)?;
        }

        let considered = ConsideredVote {
            voter_id: voter.clone(),
            record_id: record.record_id.clone(),
            submitted_at: record.submitted_at,
        };
        for election in &token.bound_election_ids {
            AuditLog::new(self.store, election).append(&considered)?;
        }

        info!(
            "Stored vote {} of {voter} for {} election(s)",
            record.record_id,
            token.bound_election_ids.len()
        );
        Ok(token)
    }

    fn store_record(&self, record: &mut VoteRecord) -> Result<()> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let key = keys::vote_record(&record.voter_id, &record.record_id);
            match self.store.create_json(&key, record) {
                Ok(()) => return Ok(()),
                Err(StoreError::AlreadyExists(_)) => {
                    debug!("Record id {} taken, drawing another", record.record_id);
                    record.regenerate_id();
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::InconsistentState(format!(
            "no free record id for {} after {MAX_ID_ATTEMPTS} attempts",
            record.voter_id
        )))
    }
}
