use chrono::Utc;

use crate::audit::{AuditLog, RevocationEntry};
use crate::error::{Error, Result};
use crate::keys;
use crate::model::{
    BatchReport, Petition, PetitionBatch, PetitionMode, RejectedPetition, RevocationMark,
    VoterId,
};
use crate::phase::ElectionPhase;
use crate::service::{invalidate_voter_token, latest_record};
use crate::store::Store;
use crate::trust::{Role, SignedEnvelope, TrustOracle};

/// Applies signed petition batches that void or reinstate votes.
pub struct RevocationService<'a, S, T: ?Sized> {
    store: &'a S,
    oracle: &'a T,
}

impl<'a, S: Store, T: TrustOracle + ?Sized> RevocationService<'a, S, T> {
    pub fn new(store: &'a S, oracle: &'a T) -> Self {
        Self { store, oracle }
    }

    /// Apply every entry of a signed batch independently and report on each.
    /// The batch must be signed by `operator_id` in their revocation
    /// operator role.
    pub fn apply_batch(
        &self,
        phase: ElectionPhase,
        envelope: &SignedEnvelope,
        operator_id: &str,
    ) -> Result<BatchReport> {
        phase.require("revocation", &[ElectionPhase::Revocation])?;
        let verified = self
            .oracle
            .verify(envelope, Role::RevocationOperator)
            .map_err(|e| {
                warn!("Petition batch from {operator_id} refused by trust oracle: {e}");
                Error::from(e)
            })?;
        if verified.signer != operator_id {
            warn!(
                "Petition batch presented by {operator_id} is signed by {}",
                verified.signer
            );
            return Err(Error::SignatureInvalid(format!(
                "batch is not signed by operator {operator_id}"
            )));
        }
        let batch: PetitionBatch = serde_json::from_slice(&verified.content)
            .map_err(|e| Error::MalformedEnvelope(format!("undecodable petition batch: {e}")))?;

        info!(
            "Applying {} batch of {} petition(s) from {operator_id}",
            batch.mode,
            batch.entries.len()
        );
        let mut report = BatchReport::new(operator_id, batch.mode);
        for petition in batch.entries {
            match self.apply(batch.mode, &petition, operator_id) {
                Ok(()) => {
                    info!("{} of {} accepted", batch.mode, petition.personal_id);
                    report.accepted.push(petition);
                }
                Err(e) if e.is_fatal() => {
                    error!(
                        "Aborting petition batch at {}: {e}",
                        petition.personal_id
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!("{} of {} rejected: {e}", batch.mode, petition.personal_id);
                    report.rejected.push(RejectedPetition {
                        petition,
                        reason: e.to_string(),
                    });
                }
            }
        }
        info!(
            "Petition batch from {operator_id}: {} accepted, {} rejected",
            report.accepted.len(),
            report.rejected.len()
        );
        Ok(report)
    }

    fn apply(&self, mode: PetitionMode, petition: &Petition, operator_id: &str) -> Result<()> {
        let voter: VoterId = petition
            .personal_id
            .parse()
            .map_err(|_| Error::NotAVoter(petition.personal_id.clone()))?;
        let _lock = self.store.lock_exclusive(&keys::voter_lock(&voter))?;

        let record = latest_record(self.store, &voter)?
            .ok_or_else(|| Error::NotAVoter(petition.personal_id.clone()))?;
        let mark = keys::revocation_mark(&voter);
        let now = Utc::now();
        match mode {
            PetitionMode::Revoke => {
                if self.store.exists(&mark)? {
                    return Err(Error::AlreadyRevoked(voter));
                }
                self.store.create_json(
                    &mark,
                    &RevocationMark {
                        voter_id: voter.clone(),
                        marked_at: now,
                        reason: petition.reason.clone(),
                        operator_id: operator_id.to_string(),
                        record_id: record.record_id.clone(),
                    },
                )?;
                // A revoked vote can no longer be verified.
                invalidate_voter_token(self.store, &voter)?;
            }
            PetitionMode::Restore => {
                if !self.store.remove(&mark)? {
                    return Err(Error::NotRevoked(voter));
                }
            }
        }

        let entry = RevocationEntry {
            voter_id: voter,
            mode,
            operator_id: operator_id.to_string(),
            reason: petition.reason.clone(),
            record_id: record.record_id.clone(),
            vote_submitted_at: record.submitted_at,
            processed_at: now,
        };
        for election in record.election_ids() {
            AuditLog::new(self.store, &election).append(&entry)?;
        }
        Ok(())
    }
}
