//! Storage, verification, revocation and tabulation core of an internet
//! voting system.
//!
//! Every request is served by a short-lived process; all coordination between
//! requests happens through the [`store::Store`] and its per-key locks.

#[macro_use]
extern crate log;

pub mod audit;
pub mod config;
pub mod device;
pub mod error;
pub mod keys;
pub mod logging;
pub mod model;
pub mod phase;
pub mod service;
pub mod store;
pub mod trust;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use error::{Error, Result};
pub use phase::{ElectionPhase, PhaseController};
