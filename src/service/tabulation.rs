use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use rand::seq::SliceRandom;

use crate::audit::{
    AuditLog, ConsideredVote, ExcludedVote, ExclusionReason, ForwardedVote, RejectedBallot,
    TalliedBallot,
};
use crate::device::{CryptoDevice, DeviceError};
use crate::error::{Error, Result};
use crate::keys;
use crate::model::{
    ChoiceCode, DistrictId, Election, ElectionId, EncryptedBallot, LogCounts, SignedResult,
    TabulationResult, TabulationTally, VoteRecord, VoterId,
};
use crate::phase::ElectionPhase;
use crate::service::{load_election, voter_district, voter_records, voters_with_records};
use crate::store::Store;

/// What a decrypted ballot turned out to be.
enum Verdict {
    Valid(ChoiceCode),
    /// Readable, but names no choice legal in the voter's district.
    InvalidChoice(Error),
    /// Not a ballot for this election at all.
    Unreadable(Error),
}

/// Judge a decrypted plaintext of the form `<election id>:<choice code>`.
fn judge(election: &Election, district: &DistrictId, plaintext: &[u8]) -> Verdict {
    let Ok(text) = std::str::from_utf8(plaintext) else {
        return Verdict::Unreadable(Error::DecryptionFailed(
            "plaintext is not UTF-8".to_string(),
        ));
    };
    let Some((election_id, choice)) = text.split_once(':') else {
        return Verdict::Unreadable(Error::DecryptionFailed(
            "plaintext has no election id".to_string(),
        ));
    };
    if election_id != election.id.as_str() {
        return Verdict::Unreadable(Error::InvalidBallotContent(format!(
            "ballot is for election {election_id:?}"
        )));
    }
    let legal = election
        .district(district)
        .and_then(|d| choice.parse::<ChoiceCode>().ok().filter(|c| d.choice(c).is_some()));
    match legal {
        Some(code) => Verdict::Valid(code),
        None => Verdict::InvalidChoice(Error::InvalidBallotContent(format!(
            "{choice:?} is not a choice in district {district}"
        ))),
    }
}

/// A ballot queued for decryption. Carries nothing that names its voter.
struct Queued {
    district: DistrictId,
    ballot: EncryptedBallot,
}

/// The store-side bookkeeping of tabulation: which records an election has
/// to account for and what its audit logs hold. Needs no crypto device.
pub struct TabulationLedger<'a, S> {
    store: &'a S,
}

impl<'a, S: Store> TabulationLedger<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Undo a tabulation that stopped part way: empties logs 2 to 5 and
    /// removes any stored result. Log 1 belongs to submission and stays, but
    /// gains the lines of any record whose submission died before logging it.
    /// Returns the number of lines added to log 1.
    pub fn rollback_tabulation(
        &self,
        phase: ElectionPhase,
        election_id: &ElectionId,
    ) -> Result<usize> {
        phase.require("tabulation rollback", &[ElectionPhase::Tabulation])?;
        load_election(self.store, election_id)?;
        let _lock = self.store.lock_exclusive(&keys::tabulation_lock(election_id))?;
        AuditLog::<_, ExcludedVote>::new(self.store, election_id).clear()?;
        AuditLog::<_, ForwardedVote>::new(self.store, election_id).clear()?;
        AuditLog::<_, RejectedBallot>::new(self.store, election_id).clear()?;
        AuditLog::<_, TalliedBallot>::new(self.store, election_id).clear()?;
        self.store.remove(&keys::result(election_id))?;
        let added = self.reconcile_considered(election_id)?;
        warn!("Rolled back tabulation of {election_id}, {added} vote(s) added to log 1");
        Ok(added)
    }

    /// Append to log 1 every stored record for the election it does not list
    /// yet. Lines for records that do not exist are left for `tabulate` to
    /// report.
    fn reconcile_considered(&self, election_id: &ElectionId) -> Result<usize> {
        let log = AuditLog::<_, ConsideredVote>::new(self.store, election_id);
        let listed = log
            .read()?
            .into_iter()
            .map(|line| line.record_id)
            .collect::<BTreeSet<_>>();
        let mut added = 0;
        for records in self.records_covering(election_id)?.values() {
            for record in records.iter().filter(|r| r.covers(election_id)) {
                if listed.contains(&record.record_id) {
                    continue;
                }
                warn!(
                    "Vote {} of {} was missing from log 1 of {election_id}",
                    record.record_id, record.voter_id
                );
                log.append(&ConsideredVote {
                    voter_id: record.voter_id.clone(),
                    record_id: record.record_id.clone(),
                    submitted_at: record.submitted_at,
                })?;
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn log_counts(&self, election_id: &ElectionId) -> Result<LogCounts> {
        Ok(LogCounts {
            considered: AuditLog::<_, ConsideredVote>::new(self.store, election_id).count()?,
            excluded: AuditLog::<_, ExcludedVote>::new(self.store, election_id).count()?,
            forwarded: AuditLog::<_, ForwardedVote>::new(self.store, election_id).count()?,
            rejected: AuditLog::<_, RejectedBallot>::new(self.store, election_id).count()?,
            tallied: AuditLog::<_, TalliedBallot>::new(self.store, election_id).count()?,
        })
    }

    /// All records, oldest first, of every voter with at least one record
    /// holding a ballot for the election. The newer records that do not hold
    /// one still decide whether the older ones count.
    fn records_covering(&self, election_id: &ElectionId) -> Result<BTreeMap<VoterId, Vec<VoteRecord>>> {
        let mut covering = BTreeMap::new();
        for voter in voters_with_records(self.store)? {
            let records = voter_records(self.store, &voter)?;
            if records.iter().any(|r| r.covers(election_id)) {
                covering.insert(voter, records);
            }
        }
        Ok(covering)
    }
}

/// Number of records that hold a ballot for the election.
fn covering_count(records: &BTreeMap<VoterId, Vec<VoteRecord>>, election_id: &ElectionId) -> usize {
    records
        .values()
        .flatten()
        .filter(|r| r.covers(election_id))
        .count()
}

/// Decides which vote counts for each voter, decrypts those ballots and
/// produces the signed result.
pub struct TabulationService<'a, S, D: ?Sized> {
    ledger: TabulationLedger<'a, S>,
    store: &'a S,
    device: &'a D,
}

impl<'a, S: Store, D: CryptoDevice + ?Sized> TabulationService<'a, S, D> {
    pub fn new(store: &'a S, device: &'a D) -> Self {
        Self {
            ledger: TabulationLedger::new(store),
            store,
            device,
        }
    }

    /// Tabulate one election. Running it again after success returns the
    /// stored result once it has been re-derived and found identical.
    pub fn tabulate(&self, phase: ElectionPhase, election_id: &ElectionId) -> Result<SignedResult> {
        phase.require("tabulation", &[ElectionPhase::Tabulation])?;
        let election = load_election(self.store, election_id)?;
        let _lock = self.store.lock_exclusive(&keys::tabulation_lock(election_id))?;

        let records = self.ledger.records_covering(election_id)?;
        let counts = self.log_counts(election_id)?;
        let submitted = covering_count(&records, election_id);
        if counts.considered != submitted {
            return Err(inconsistent(format!(
                "{election_id}: log 1 lists {} votes, the store holds {submitted}",
                counts.considered
            )));
        }

        if let Some(stored) = self.store.get_json::<SignedResult>(&keys::result(election_id))? {
            info!("{election_id} was already tabulated, re-deriving the result");
            let (tally, derived) = self.run(&election, &records, false)?;
            if !stored.hash_matches()
                || !counts.is_consistent()
                || derived != counts
                || stored.result.log_counts != counts
                || stored.result.tally != tally
            {
                return Err(inconsistent(format!(
                    "{election_id}: stored result does not match the votes and logs"
                )));
            }
            return Ok(stored);
        }
        if !counts.is_untouched() {
            return Err(inconsistent(format!(
                "{election_id}: an earlier tabulation stopped part way, roll it back first"
            )));
        }

        info!("Tabulating {election_id}: {submitted} vote(s) from {} voter(s)", records.len());
        let (tally, derived) = self.run(&election, &records, true)?;
        let counts = self.log_counts(election_id)?;
        if !counts.is_consistent() || counts != derived {
            return Err(inconsistent(format!(
                "{election_id}: audit logs disagree after tabulation: {counts:?}"
            )));
        }

        let result = TabulationResult::new(election_id.clone(), tally, counts);
        let signed = SignedResult::sign(result, self.device).map_err(|e| {
            error!("Signing the result of {election_id} failed: {e}");
            e
        })?;
        self.store.replace_json(&keys::result(election_id), &signed)?;
        info!(
            "Tabulated {election_id}: {} valid, {} invalid, result {}",
            signed.result.tally.valid_total(),
            signed.result.invalid_total,
            signed.result_hash
        );
        Ok(signed)
    }

    /// See [`TabulationLedger::rollback_tabulation`].
    pub fn rollback_tabulation(
        &self,
        phase: ElectionPhase,
        election_id: &ElectionId,
    ) -> Result<usize> {
        self.ledger.rollback_tabulation(phase, election_id)
    }

    pub fn log_counts(&self, election_id: &ElectionId) -> Result<LogCounts> {
        self.ledger.log_counts(election_id)
    }

    /// Decide, decrypt and count. With `write` unset nothing is appended to
    /// the logs and the counts are only what would have been written.
    fn run(
        &self,
        election: &Election,
        records: &BTreeMap<VoterId, Vec<VoteRecord>>,
        write: bool,
    ) -> Result<(TabulationTally, LogCounts)> {
        let id = &election.id;
        let excluded_log = AuditLog::<_, ExcludedVote>::new(self.store, id);
        let forwarded_log = AuditLog::<_, ForwardedVote>::new(self.store, id);
        let rejected_log = AuditLog::<_, RejectedBallot>::new(self.store, id);
        let tallied_log = AuditLog::<_, TalliedBallot>::new(self.store, id);

        let mut counts = LogCounts {
            considered: covering_count(records, id),
            ..LogCounts::default()
        };
        let mut queue = Vec::with_capacity(records.len());
        let decided_at = Utc::now();

        for (voter, records) in records {
            let revoked = self.store.exists(&keys::revocation_mark(voter))?;
            // Position 0 is the voter's newest record, whatever it covers. When
            // it leaves this election out, every older ballot for it is
            // superseded.
            for (position, record) in records.iter().rev().enumerate() {
                if !record.covers(id) {
                    continue;
                }
                let reason = match (position, revoked) {
                    (0, false) => None,
                    (0, true) => Some(ExclusionReason::Revoked),
                    _ => Some(ExclusionReason::Superseded),
                };
                match reason {
                    Some(reason) => {
                        counts.excluded += 1;
                        if write {
                            excluded_log.append(&ExcludedVote {
                                voter_id: voter.clone(),
                                record_id: record.record_id.clone(),
                                submitted_at: record.submitted_at,
                                reason,
                            })?;
                        }
                    }
                    None => {
                        let district = voter_district(self.store, id, voter)?.ok_or_else(|| {
                            inconsistent(format!("{voter} voted in {id} without eligibility"))
                        })?;
                        let ballot = record.ballot(id).cloned().ok_or_else(|| {
                            inconsistent(format!("record {} lost its ballot", record.record_id))
                        })?;
                        counts.forwarded += 1;
                        if write {
                            forwarded_log.append(&ForwardedVote {
                                voter_id: voter.clone(),
                                record_id: record.record_id.clone(),
                                submitted_at: record.submitted_at,
                                decided_at,
                            })?;
                        }
                        queue.push(Queued { district, ballot });
                    }
                }
            }
        }

        // Break the link between log 3 order and decryption order.
        queue.shuffle(&mut rand::thread_rng());

        let ciphertexts = queue
            .iter()
            .map(|q| q.ballot.ciphertext.as_slice())
            .collect::<Vec<_>>();
        let plaintexts = self.device.decrypt_batch(&ciphertexts);
        if plaintexts.len() != queue.len() {
            return Err(Error::Device(DeviceError::Malfunction(format!(
                "device returned {} plaintexts for {} ballots",
                plaintexts.len(),
                queue.len()
            ))));
        }

        let mut tally = TabulationTally::new(election);
        for (queued, plaintext) in queue.iter().zip(plaintexts) {
            let verdict = match plaintext {
                Ok(plaintext) => judge(election, &queued.district, &plaintext),
                Err(DeviceError::Decryption) => Verdict::Unreadable(Error::DecryptionFailed(
                    "device refused the ciphertext".to_string(),
                )),
                Err(e) => {
                    error!("Crypto device failed during tabulation of {id}: {e}");
                    return Err(e.into());
                }
            };
            match verdict {
                Verdict::Valid(choice) => {
                    tally.count_valid(&queued.district, &choice);
                    counts.tallied += 1;
                    if write {
                        tallied_log.append(&TalliedBallot {
                            district_id: queued.district.clone(),
                            choice,
                        })?;
                    }
                }
                Verdict::InvalidChoice(reason) => {
                    tally.count_invalid(&queued.district);
                    counts.rejected += 1;
                    if write {
                        rejected_log.append(&RejectedBallot {
                            ballot_hash: queued.ballot.hash(),
                            district_id: Some(queued.district.clone()),
                            reason: reason.to_string(),
                        })?;
                    }
                }
                Verdict::Unreadable(reason) => {
                    counts.rejected += 1;
                    if write {
                        rejected_log.append(&RejectedBallot {
                            ballot_hash: queued.ballot.hash(),
                            district_id: None,
                            reason: reason.to_string(),
                        })?;
                    }
                }
            }
        }
        Ok((tally, counts))
    }
}

fn inconsistent(detail: String) -> Error {
    error!("Tabulation found inconsistent state: {detail}");
    Error::InconsistentState(detail)
}
