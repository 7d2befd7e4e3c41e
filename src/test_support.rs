//! A fully wired instance over a temporary store, shared by the unit tests.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tempfile::TempDir;

use crate::config::Config;
use crate::device::{seal_ballot, CryptoDevice, SoftwareDevice};
use crate::error::Result;
use crate::keys;
use crate::model::{
    BallotBundle, BatchReport, Election, ElectionId, EncryptedBallot, Petition, PetitionBatch,
    PetitionMode, VerificationToken, VoterId, VoterList,
};
use crate::phase::{ElectionPhase, PhaseController};
use crate::service::{
    RevocationService, SetupService, SubmissionService, TabulationService, VerificationService,
};
use crate::store::{FsStore, Store};
use crate::trust::{seal_envelope, Certificate, CertificateRegistry, Role, SignedEnvelope};

pub const OPERATOR: &str = "operator-1";

/// Voters holding a certificate. `v4` is certified but on no list.
const VOTERS: [&str; 4] = ["v1", "v2", "v3", "v4"];

pub struct Fixture {
    // Keeps the store directory alive for the fixture's lifetime.
    _dir: TempDir,
    pub store: FsStore,
    pub config: Config,
    pub registry: CertificateRegistry,
    pub operator: SigningKey,
    pub device: SoftwareDevice,
    voters: BTreeMap<&'static str, SigningKey>,
}

pub fn init_logging() {
    log4rs_test_utils::test_logging::init_logging_once_for(["ivote_store"], None, None);
}

impl Fixture {
    /// No elections, phase Setup.
    pub fn empty() -> Self {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path().join("store")).unwrap();
        let config = Config::example(&dir.path().join("store"));

        let voters: BTreeMap<_, _> = VOTERS
            .iter()
            .map(|&name| (name, SigningKey::generate(&mut OsRng)))
            .collect();
        let operator = SigningKey::generate(&mut OsRng);
        let mut certificates = voters
            .iter()
            .map(|(name, key)| Certificate::example(name, key, &[Role::Voter]))
            .collect::<Vec<_>>();
        certificates.push(Certificate::example(
            OPERATOR,
            &operator,
            &[Role::RevocationOperator],
        ));
        let registry = CertificateRegistry::new(certificates).unwrap();

        Self {
            _dir: dir,
            store,
            config,
            registry,
            operator,
            device: SoftwareDevice::generate(),
            voters,
        }
    }

    /// Both example elections and their lists loaded and agreed with the
    /// relay, still in Setup.
    pub fn new() -> Self {
        let fixture = Self::empty();
        let setup = fixture.setup();
        for election in [Election::example1(), Election::example2()] {
            setup.load_election(ElectionPhase::Setup, &election).unwrap();
        }
        for list in [VoterList::example1(), VoterList::example2()] {
            setup.load_voters(ElectionPhase::Setup, &list).unwrap();
        }
        assert!(setup.check_consistency(&setup.list_hash().unwrap()).unwrap());
        fixture
    }

    pub fn voting() -> Self {
        let fixture = Self::new();
        fixture.advance_to(ElectionPhase::Voting);
        fixture
    }

    pub fn phase(&self) -> ElectionPhase {
        PhaseController::new(&self.store).current().unwrap()
    }

    /// Step forward one phase at a time until `target`.
    pub fn advance_to(&self, target: ElectionPhase) {
        let controller = PhaseController::new(&self.store);
        while controller.current().unwrap() != target {
            let next = controller.current().unwrap().next().unwrap();
            controller.advance(next).unwrap();
        }
    }

    pub fn voter(&self, name: &str) -> VoterId {
        name.parse().unwrap()
    }

    pub fn remove_eligibility(&self, election: &str, voter: &str) {
        let election: ElectionId = election.parse().unwrap();
        assert!(self
            .store
            .remove(&keys::eligibility(&election, &self.voter(voter)))
            .unwrap());
    }

    pub fn setup(&self) -> SetupService<'_, FsStore> {
        SetupService::new(&self.store)
    }

    pub fn submission(&self) -> SubmissionService<'_, FsStore, CertificateRegistry> {
        SubmissionService::new(&self.store, &self.registry, &self.config)
    }

    pub fn verification(&self) -> VerificationService<'_, FsStore> {
        VerificationService::new(&self.store, &self.config)
    }

    pub fn revocation(&self) -> RevocationService<'_, FsStore, CertificateRegistry> {
        RevocationService::new(&self.store, &self.registry)
    }

    pub fn tabulation(&self) -> TabulationService<'_, FsStore, SoftwareDevice> {
        TabulationService::new(&self.store, &self.device)
    }

    /// A ballot for `election` sealed to the device, with arbitrary content.
    pub fn sealed_ballot(&self, election: &str, plaintext: &[u8]) -> EncryptedBallot {
        EncryptedBallot {
            election_id: election.parse().unwrap(),
            ciphertext: seal_ballot(&self.device.encryption_key(), plaintext).unwrap(),
        }
    }

    /// Open a ciphertext with the device, as text.
    pub fn open(&self, ciphertext: &[u8]) -> String {
        String::from_utf8(self.device.decrypt(ciphertext).unwrap()).unwrap()
    }

    /// Encoded bundle with one well-formed ballot per `(election, choice)`.
    pub fn bundle(&self, choices: &[(&str, &str)]) -> Vec<u8> {
        let ballots = choices
            .iter()
            .map(|(election, choice)| {
                self.sealed_ballot(election, format!("{election}:{choice}").as_bytes())
            })
            .collect();
        serde_json::to_vec(&BallotBundle { ballots }).unwrap()
    }

    pub fn sign(&self, voter: &str, content: &[u8]) -> SignedEnvelope {
        seal_envelope(&self.voters[voter], content, Utc::now())
    }

    pub fn envelope(&self, voter: &str, choices: &[(&str, &str)]) -> SignedEnvelope {
        self.envelope_at(voter, choices, Utc::now())
    }

    pub fn envelope_at(
        &self,
        voter: &str,
        choices: &[(&str, &str)],
        signed_at: DateTime<Utc>,
    ) -> SignedEnvelope {
        seal_envelope(&self.voters[voter], &self.bundle(choices), signed_at)
    }

    pub fn submit_envelope(&self, envelope: &SignedEnvelope) -> Result<VerificationToken> {
        self.submission().submit(self.phase(), envelope)
    }

    pub fn submit(&self, voter: &str, choices: &[(&str, &str)]) -> Result<VerificationToken> {
        self.submit_envelope(&self.envelope(voter, choices))
    }

    pub fn submit_ballots(
        &self,
        voter: &str,
        ballots: Vec<EncryptedBallot>,
    ) -> Result<VerificationToken> {
        let content = serde_json::to_vec(&BallotBundle { ballots }).unwrap();
        self.submit_envelope(&self.sign(voter, &content))
    }

    pub fn batch(&self, mode: PetitionMode, voters: &[&str]) -> PetitionBatch {
        PetitionBatch {
            mode,
            entries: voters
                .iter()
                .map(|voter| Petition {
                    personal_id: voter.to_string(),
                    name: format!("Voter {voter}"),
                    reason: "petition".to_string(),
                })
                .collect(),
        }
    }

    /// A batch signed by the operator.
    pub fn petition_batch(&self, mode: PetitionMode, voters: &[&str]) -> SignedEnvelope {
        let content = serde_json::to_vec(&self.batch(mode, voters)).unwrap();
        seal_envelope(&self.operator, &content, Utc::now())
    }

    pub fn revoke(&self, mode: PetitionMode, voters: &[&str]) -> Result<BatchReport> {
        self.revocation()
            .apply_batch(self.phase(), &self.petition_batch(mode, voters), OPERATOR)
    }
}
