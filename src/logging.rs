use std::fmt::{Display, Formatter};
use std::path::Path;

use thiserror::Error as ThisError;

use crate::error::{Category, Error};

#[derive(Debug, ThisError)]
#[error("failed to initialise logging from {path}: {detail}")]
pub struct LoggingError {
    path: String,
    detail: String,
}

/// A unique identifier for one request, i.e. one process run, so that the
/// lines of concurrent requests can be told apart in the shared log file.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct RequestId(pub u32);

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl RequestId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

/// Initialise log4rs from its YAML configuration.
pub fn init(config: &Path) -> Result<(), LoggingError> {
    log4rs::init_file(config, Default::default()).map_err(|e| LoggingError {
        path: config.display().to_string(),
        detail: e.to_string(),
    })
}

/// Log an incoming request.
pub fn log_request(id: RequestId, command: &str) {
    info!("->req{id} {command}");
}

/// Log the outcome of a request at a level matching its severity.
pub fn log_outcome<T>(id: RequestId, command: &str, outcome: &Result<T, Error>) {
    match outcome {
        Ok(_) => info!("<-req{id} {command} ok"),
        Err(e) => {
            let response = e.response();
            let msg = format!("<-req{id} {command} failed ({:?}): {e}", response.category);
            match response.category {
                Category::Internal => error!("{msg}"),
                _ => warn!("{msg}"),
            }
        }
    }
}
