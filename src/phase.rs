//! The election phase state machine gating every other component.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::error::{Error, Result};
use crate::keys;
use crate::store::Store;

/// Phases of an election instance, in the only order they may occur.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ElectionPhase {
    /// Elections and eligibility lists are being loaded.
    Setup = 0,
    /// Ballots are accepted.
    Voting = 1,
    /// Signed petitions may void or reinstate votes.
    Revocation = 2,
    /// Votes are decrypted and counted. Terminal.
    Tabulation = 3,
}

impl ElectionPhase {
    /// The phase that follows this one, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Setup => Some(Self::Voting),
            Self::Voting => Some(Self::Revocation),
            Self::Revocation => Some(Self::Tabulation),
            Self::Tabulation => None,
        }
    }

    /// Fail with [`Error::WrongPhase`] unless this is one of `allowed`.
    /// The rejection is always logged.
    pub fn require(self, operation: &'static str, allowed: &[ElectionPhase]) -> Result<()> {
        if allowed.contains(&self) {
            Ok(())
        } else {
            error!("Rejected {operation}: not permitted in phase {self}");
            Err(Error::WrongPhase {
                operation,
                actual: self,
            })
        }
    }
}

impl Display for ElectionPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Setup => "setup",
            Self::Voting => "voting",
            Self::Revocation => "revocation",
            Self::Tabulation => "tabulation",
        })
    }
}

impl FromStr for ElectionPhase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "setup" => Ok(Self::Setup),
            "voting" => Ok(Self::Voting),
            "revocation" => Ok(Self::Revocation),
            "tabulation" => Ok(Self::Tabulation),
            other => Err(format!("unknown phase {other:?}")),
        }
    }
}

/// The single authority over the persisted phase.
pub struct PhaseController<'a, S> {
    store: &'a S,
}

impl<'a, S: Store> PhaseController<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// The current phase. A store that has never been advanced is in Setup.
    pub fn current(&self) -> Result<ElectionPhase> {
        let _lock = self.store.lock_shared(&keys::phase_lock())?;
        self.read()
    }

    fn read(&self) -> Result<ElectionPhase> {
        Ok(self
            .store
            .get_json(&keys::phase())?
            .unwrap_or(ElectionPhase::Setup))
    }

    /// Move to `to`, which must be the immediate successor of the current
    /// phase. There is no way back.
    pub fn advance(&self, to: ElectionPhase) -> Result<ElectionPhase> {
        let _lock = self.store.lock_exclusive(&keys::phase_lock())?;
        let current = self.read()?;
        if current.next() != Some(to) {
            error!("Refused phase transition {current} -> {to}");
            return Err(Error::WrongPhase {
                operation: "phase transition",
                actual: current,
            });
        }
        self.store.replace_json(&keys::phase(), &to)?;
        warn!("Election phase advanced {current} -> {to}");
        Ok(to)
    }
}
