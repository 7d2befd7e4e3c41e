use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::keys;
use crate::model::{DistrictId, Election, VoterList};
use crate::phase::ElectionPhase;
use crate::service::{election_ids, load_election};
use crate::store::Store;

/// Stored while submission is disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Maintenance {
    pub since: DateTime<Utc>,
    pub relay_hash: String,
    pub store_hash: String,
}

/// Loads elections and eligibility lists, and keeps the store in step with
/// the relay's copy of the lists.
pub struct SetupService<'a, S> {
    store: &'a S,
}

impl<'a, S: Store> SetupService<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Load or reload an election definition.
    pub fn load_election(&self, phase: ElectionPhase, election: &Election) -> Result<()> {
        phase.require("loading elections", &[ElectionPhase::Setup])?;
        election.validate().map_err(|e| {
            warn!("Refused election definition: {e}");
            Error::InvalidDefinition(e)
        })?;
        self.store
            .replace_json(&keys::election_definition(&election.id), election)?;
        info!(
            "Loaded election {} with {} district(s)",
            election.id,
            election.districts.len()
        );
        Ok(())
    }

    /// Replace the eligibility list of an already loaded election. Returns
    /// the number of eligible voters.
    pub fn load_voters(&self, phase: ElectionPhase, list: &VoterList) -> Result<usize> {
        phase.require("loading voter lists", &[ElectionPhase::Setup])?;
        let election = load_election(self.store, &list.election_id)?;

        let mut seen = BTreeSet::new();
        for entry in &list.voters {
            if election.district(&entry.district_id).is_none() {
                return Err(Error::InvalidDefinition(format!(
                    "voter {} is listed in unknown district {} of {}",
                    entry.voter_id, entry.district_id, election.id
                )));
            }
            if !seen.insert(&entry.voter_id) {
                return Err(Error::InvalidDefinition(format!(
                    "voter {} is listed twice for {}",
                    entry.voter_id, election.id
                )));
            }
        }

        let dir = keys::eligibility_list(&election.id);
        for stale in self.store.children(&dir)? {
            self.store.remove(&dir.child(&stale)?)?;
        }
        for entry in &list.voters {
            self.store.replace_json(
                &keys::eligibility(&election.id, &entry.voter_id),
                &entry.district_id,
            )?;
        }
        let hash = self.list_hash()?;
        self.store.replace_json(&keys::list_hash(), &hash)?;
        info!(
            "Loaded {} eligible voter(s) for {}, list hash now {hash}",
            list.voters.len(),
            election.id
        );
        Ok(list.voters.len())
    }

    /// Hex SHA-256 over every eligibility entry of every election, in key
    /// order, one `<election>\t<voter>\t<district>` line each.
    pub fn list_hash(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        for election in election_ids(self.store)? {
            let dir = keys::eligibility_list(&election);
            for voter in self.store.children(&dir)? {
                let district: DistrictId = self
                    .store
                    .get_json(&dir.child(&voter)?)?
                    .ok_or_else(|| {
                        Error::InconsistentState(format!("eligibility of {voter} vanished"))
                    })?;
                hasher.update(format!("{election}\t{voter}\t{district}\n"));
            }
        }
        Ok(HEXLOWER.encode(&hasher.finalize()))
    }

    /// Compare the relay's list hash with ours. A match records the hash as
    /// agreed; a mismatch disables submission until a later check matches
    /// again.
    pub fn check_consistency(&self, relay_hash: &str) -> Result<bool> {
        let store_hash = self.list_hash()?;
        if relay_hash == store_hash {
            self.store.replace_json(&keys::agreed_list_hash(), &store_hash)?;
            if self.store.remove(&keys::maintenance())? {
                warn!("Eligibility lists back in sync with the relay, maintenance mode cleared");
            } else {
                debug!("Eligibility lists in sync with the relay");
            }
            return Ok(true);
        }
        error!("Eligibility lists out of sync: relay has {relay_hash}, store has {store_hash}");
        self.store.remove(&keys::agreed_list_hash())?;
        if !self.in_maintenance()? {
            self.store.replace_json(
                &keys::maintenance(),
                &Maintenance {
                    since: Utc::now(),
                    relay_hash: relay_hash.to_string(),
                    store_hash,
                },
            )?;
            warn!("Maintenance mode entered, submission disabled");
        }
        Ok(false)
    }

    pub fn in_maintenance(&self) -> Result<bool> {
        Ok(self.store.exists(&keys::maintenance())?)
    }

    /// Whether the relay has confirmed the lists exactly as currently
    /// loaded. Submission is refused otherwise.
    pub fn lists_agreed(&self) -> Result<bool> {
        if self.in_maintenance()? {
            return Ok(false);
        }
        let agreed: Option<String> = self.store.get_json(&keys::agreed_list_hash())?;
        let current: Option<String> = self.store.get_json(&keys::list_hash())?;
        Ok(agreed.is_some() && agreed == current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ElectionId, VoterId};
    use crate::service::voter_district;
    use crate::test_support::Fixture;

    #[test]
    fn loads_elections_and_lists() {
        let fixture = Fixture::new();
        let ids = election_ids(&fixture.store).unwrap();
        assert_eq!(
            ids.iter().map(ElectionId::as_str).collect::<Vec<_>>(),
            vec!["parliament", "referendum"]
        );
        let district = voter_district(
            &fixture.store,
            &"parliament".parse().unwrap(),
            &fixture.voter("v2"),
        )
        .unwrap();
        assert_eq!(district.unwrap().as_str(), "south");
    }

    #[test]
    fn reloading_a_list_replaces_it() {
        let fixture = Fixture::new();
        let before = fixture.setup().list_hash().unwrap();
        let list = VoterList::of("parliament", &[("v1", "south")]);
        assert_eq!(
            fixture
                .setup()
                .load_voters(ElectionPhase::Setup, &list)
                .unwrap(),
            1
        );

        let parliament: ElectionId = "parliament".parse().unwrap();
        let v3: VoterId = fixture.voter("v3");
        assert!(voter_district(&fixture.store, &parliament, &v3)
            .unwrap()
            .is_none());
        let after = fixture.setup().list_hash().unwrap();
        assert_ne!(before, after);
        let stored: String = fixture.store.get_json(&keys::list_hash()).unwrap().unwrap();
        assert_eq!(stored, after);
    }

    #[test]
    fn bad_definitions_are_refused() {
        let fixture = Fixture::empty();
        let setup = fixture.setup();
        let mut election = Election::example1();
        election.districts.clear();
        assert!(matches!(
            setup.load_election(ElectionPhase::Setup, &election),
            Err(Error::InvalidDefinition(_))
        ));

        // Lists need their election first.
        let list = VoterList::example1();
        assert!(matches!(
            setup.load_voters(ElectionPhase::Setup, &list),
            Err(Error::UnknownElection(_))
        ));

        setup
            .load_election(ElectionPhase::Setup, &Election::example1())
            .unwrap();
        let unknown_district = VoterList::of("parliament", &[("v1", "east")]);
        assert!(matches!(
            setup.load_voters(ElectionPhase::Setup, &unknown_district),
            Err(Error::InvalidDefinition(_))
        ));
        let twice = VoterList::of("parliament", &[("v1", "north"), ("v1", "south")]);
        assert!(matches!(
            setup.load_voters(ElectionPhase::Setup, &twice),
            Err(Error::InvalidDefinition(_))
        ));
    }

    #[test]
    fn loading_is_only_for_setup() {
        let fixture = Fixture::voting();
        assert!(matches!(
            fixture
                .setup()
                .load_election(ElectionPhase::Voting, &Election::example1()),
            Err(Error::WrongPhase { .. })
        ));
        assert!(matches!(
            fixture
                .setup()
                .load_voters(ElectionPhase::Voting, &VoterList::example1()),
            Err(Error::WrongPhase { .. })
        ));
    }

    #[test]
    fn consistency_check_toggles_maintenance() {
        let fixture = Fixture::new();
        let setup = fixture.setup();
        let hash = setup.list_hash().unwrap();

        assert!(setup.check_consistency(&hash).unwrap());
        assert!(!setup.in_maintenance().unwrap());

        assert!(!setup.check_consistency("stale").unwrap());
        assert!(setup.in_maintenance().unwrap());
        let maintenance: Maintenance = fixture
            .store
            .get_json(&keys::maintenance())
            .unwrap()
            .unwrap();
        assert_eq!(maintenance.relay_hash, "stale");
        assert_eq!(maintenance.store_hash, hash);

        assert!(setup.check_consistency(&hash).unwrap());
        assert!(!setup.in_maintenance().unwrap());
    }

    #[test]
    fn lists_count_as_agreed_only_after_a_matching_check() {
        let fixture = Fixture::empty();
        let setup = fixture.setup();
        setup
            .load_election(ElectionPhase::Setup, &Election::example1())
            .unwrap();
        setup
            .load_voters(ElectionPhase::Setup, &VoterList::example1())
            .unwrap();
        assert!(!setup.lists_agreed().unwrap());

        assert!(setup.check_consistency(&setup.list_hash().unwrap()).unwrap());
        assert!(setup.lists_agreed().unwrap());

        // Reloading a list changes the hash the relay agreed to.
        let list = VoterList::of("parliament", &[("v1", "south")]);
        setup.load_voters(ElectionPhase::Setup, &list).unwrap();
        assert!(!setup.lists_agreed().unwrap());
        assert!(setup.check_consistency(&setup.list_hash().unwrap()).unwrap());
        assert!(setup.lists_agreed().unwrap());

        assert!(!setup.check_consistency("stale").unwrap());
        assert!(!setup.lists_agreed().unwrap());
        assert!(!fixture.store.exists(&keys::agreed_list_hash()).unwrap());
    }
}
