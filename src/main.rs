use std::fs;
use std::path::{Path, PathBuf};

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::{error, info, warn};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;

use ivote_store::config::ConfigError;
use ivote_store::device::{DeviceError, SealedKeyFile, SoftwareDevice};
use ivote_store::logging::{self, LoggingError, RequestId};
use ivote_store::model::{Election, ElectionId, VoterList};
use ivote_store::service::{
    election_ids, RevocationService, SetupService, SubmissionService, TabulationLedger,
    TabulationService, VerificationService,
};
use ivote_store::store::{FsStore, StoreError};
use ivote_store::trust::{CertificateRegistry, RegistryError, SignedEnvelope};
use ivote_store::{Config, ElectionPhase, PhaseController};

const PROGRAM_NAME: &str = "ivote-store";

const ABOUT_TEXT: &str = "Serve one request against the vote store.

EXIT CODES:
     0: Request served.
     1: Request refused or failed; the reason is logged.
     2: Usage error.";

/// Errors of the entry point itself, as opposed to refusals by the store.
#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Logging(#[from] LoggingError),
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path} is not valid: {detail}")]
    Format { path: PathBuf, detail: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("no device activation secret configured")]
    MissingSecret,
    #[error("device key file {0} already exists")]
    KeyFileExists(PathBuf),
    #[error("{0} is the final phase")]
    NoNextPhase(ElectionPhase),
    #[error(transparent)]
    Refused(#[from] ivote_store::Error),
}

/// Construct the CLI configuration.
fn cli() -> Command {
    // Make the build dirty when the toml changes.
    include_str!("../Cargo.toml");

    let file = |name: &'static str, help: &'static str| {
        Arg::new(name)
            .help(help)
            .action(ArgAction::Set)
            .value_parser(value_parser!(PathBuf))
            .required(true)
    };
    let election = |required: bool| {
        Arg::new("election")
            .help("Election id")
            .action(ArgAction::Set)
            .required(required)
    };

    clap::command!(PROGRAM_NAME)
        .about(ABOUT_TEXT)
        .subcommand_required(true)
        .subcommand(Command::new("phase").about("Print the current election phase"))
        .subcommand(
            Command::new("advance")
                .about("Move to the next phase. Entering tabulation tabulates every election"),
        )
        .subcommand(
            Command::new("load-election")
                .about("Load or reload an election definition")
                .arg(file("definition", "JSON election definition")),
        )
        .subcommand(
            Command::new("load-voters")
                .about("Replace an election's eligibility list")
                .arg(file("list", "JSON voter list")),
        )
        .subcommand(
            Command::new("check-lists")
                .about("Compare the relay's eligibility list hash with the store's")
                .arg(
                    Arg::new("hash")
                        .help("Hex SHA-256 held by the relay")
                        .action(ArgAction::Set)
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("submit")
                .about("Submit a signed vote envelope")
                .arg(file("envelope", "Signed envelope file"))
                .arg(
                    Arg::new("session")
                        .long("session")
                        .help("Session id of the voter's connection, for the log")
                        .action(ArgAction::Set)
                        .default_value("-"),
                ),
        )
        .subcommand(
            Command::new("verify")
                .about("Show the ballots bound to a verification token")
                .arg(
                    Arg::new("token")
                        .help("Verification token")
                        .action(ArgAction::Set)
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("revoke")
                .about("Apply a signed revocation or restoration batch")
                .arg(file("batch", "Signed petition batch file"))
                .arg(
                    Arg::new("operator")
                        .long("operator")
                        .help("Operator presenting the batch")
                        .action(ArgAction::Set)
                        .required(true),
                )
                .arg(
                    Arg::new("report")
                        .long("report")
                        .help("Also write a readable per-entry report to this file")
                        .action(ArgAction::Set)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("tabulate")
                .about("Tabulate one election, or all of them")
                .arg(election(false)),
        )
        .subcommand(
            Command::new("rollback")
                .about("Discard a failed tabulation so it can be redone")
                .arg(election(true)),
        )
        .subcommand(
            Command::new("device-init")
                .about("Generate device keys sealed under the activation secret"),
        )
}

fn read_file(path: &Path) -> Result<Vec<u8>, CliError> {
    fs::read(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CliError> {
    serde_json::from_slice(&read_file(path)?).map_err(|e| CliError::Format {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

fn parse_election(args: &ArgMatches) -> Result<Option<ElectionId>, CliError> {
    args.get_one::<String>("election")
        .map(|id| id.parse())
        .transpose()
        .map_err(|e: ivote_store::model::InvalidId| {
            CliError::Refused(ivote_store::Error::MalformedEnvelope(e.to_string()))
        })
}

fn open_device(config: &Config) -> Result<SoftwareDevice, CliError> {
    let secret = config
        .device_activation_secret()
        .ok_or(CliError::MissingSecret)?;
    let file = SealedKeyFile::load(config.device_key_path())?;
    let device = SoftwareDevice::unseal(&file, secret)?;
    info!("Crypto device activated");
    Ok(device)
}

/// Tabulate the given elections, reporting each one's outcome separately.
fn tabulate(
    store: &FsStore,
    config: &Config,
    phase: ElectionPhase,
    elections: Vec<ElectionId>,
) -> Result<Value, CliError> {
    let device = open_device(config)?;
    let service = TabulationService::new(store, &device);
    let mut results = serde_json::Map::new();
    for election in elections {
        let outcome = match service.tabulate(phase, &election) {
            Ok(signed) => serde_json::to_value(&signed).unwrap_or(Value::Null),
            Err(e) => {
                error!("Tabulation of {election} failed: {e}");
                json!({ "error": e.response() })
            }
        };
        results.insert(election.to_string(), outcome);
    }
    Ok(Value::Object(results))
}

/// Serve the request and return what to print.
fn run(args: &ArgMatches, config: &Config) -> Result<Value, CliError> {
    let store = FsStore::open(config.store_path())?;
    let phases = PhaseController::new(&store);
    let phase = phases.current()?;

    let (command, sub) = args
        .subcommand()
        .expect("clap enforces a subcommand");
    // Unwraps below are on required arguments, which clap guarantees.
    match command {
        "phase" => Ok(json!({ "phase": phase.to_string() })),
        "advance" => {
            let next = phase.next().ok_or(CliError::NoNextPhase(phase))?;
            let now = phases.advance(next)?;
            let mut output = json!({ "phase": now.to_string() });
            if now == ElectionPhase::Tabulation {
                output["results"] = tabulate(&store, config, now, election_ids(&store)?)?;
            }
            Ok(output)
        }
        "load-election" => {
            let election: Election = read_json(sub.get_one::<PathBuf>("definition").unwrap())?;
            SetupService::new(&store).load_election(phase, &election)?;
            Ok(json!({ "election": election.id }))
        }
        "load-voters" => {
            let list: VoterList = read_json(sub.get_one::<PathBuf>("list").unwrap())?;
            let count = SetupService::new(&store).load_voters(phase, &list)?;
            Ok(json!({ "election": list.election_id, "voters": count }))
        }
        "check-lists" => {
            let hash = sub.get_one::<String>("hash").unwrap();
            let consistent = SetupService::new(&store).check_consistency(hash)?;
            Ok(json!({ "consistent": consistent }))
        }
        "submit" => {
            let session = sub.get_one::<String>("session").unwrap();
            info!("Submission in session {session}");
            let envelope =
                SignedEnvelope(read_file(sub.get_one::<PathBuf>("envelope").unwrap())?);
            let registry = CertificateRegistry::from_file(config.registry_path())?;
            let token =
                SubmissionService::new(&store, &registry, config).submit(phase, &envelope)?;
            Ok(json!({ "token": token.token_id }))
        }
        "verify" => {
            let token = sub.get_one::<String>("token").unwrap();
            let ballots = VerificationService::new(&store, config).verify(phase, token)?;
            Ok(serde_json::to_value(&ballots).unwrap_or(Value::Null))
        }
        "revoke" => {
            let operator = sub.get_one::<String>("operator").unwrap();
            let envelope = SignedEnvelope(read_file(sub.get_one::<PathBuf>("batch").unwrap())?);
            let registry = CertificateRegistry::from_file(config.registry_path())?;
            let report =
                RevocationService::new(&store, &registry).apply_batch(phase, &envelope, operator)?;
            if let Some(path) = sub.get_one::<PathBuf>("report") {
                fs::write(path, report.to_string()).map_err(|source| CliError::Io {
                    path: path.clone(),
                    source,
                })?;
            }
            Ok(serde_json::to_value(&report).unwrap_or(Value::Null))
        }
        "tabulate" => {
            let elections = match parse_election(sub)? {
                Some(election) => vec![election],
                None => election_ids(&store)?,
            };
            tabulate(&store, config, phase, elections)
        }
        "rollback" => {
            let election = parse_election(sub)?.expect("clap enforces the election");
            let added = TabulationLedger::new(&store).rollback_tabulation(phase, &election)?;
            Ok(json!({ "rolled_back": election, "considered_added": added }))
        }
        "device-init" => {
            let path = config.device_key_path();
            if path.exists() {
                return Err(CliError::KeyFileExists(path.to_path_buf()));
            }
            let secret = config
                .device_activation_secret()
                .ok_or(CliError::MissingSecret)?;
            let sealed = SoftwareDevice::generate().seal(secret)?;
            sealed.save(path)?;
            warn!("Generated new device keys at {}", path.display());
            Ok(json!({
                "verifying_key": sealed.verifying_key,
                "encryption_key": sealed.encryption_key,
            }))
        }
        _ => unreachable!("clap rejects unknown subcommands"),
    }
}

fn main() {
    // Usage errors exit with code 2 from here.
    let args = cli().get_matches();

    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1)
        }
    };
    if let Err(err) = logging::init(config.log_config()) {
        eprintln!("{err}");
        std::process::exit(1)
    }

    let id = RequestId::random();
    let command = args.subcommand_name().unwrap_or("-").to_string();
    logging::log_request(id, &command);

    match run(&args, &config) {
        Ok(output) => {
            logging::log_outcome::<()>(id, &command, &Ok(()));
            println!("{output}");
        }
        Err(CliError::Refused(err)) => {
            let response = err.response();
            logging::log_outcome::<()>(id, &command, &Err(err));
            println!("{}", json!({ "error": response }));
            std::process::exit(1)
        }
        Err(err) => {
            error!("<-req{id} {command} failed: {err}");
            println!("{}", json!({ "error": { "category": "internal", "message": err.to_string() } }));
            std::process::exit(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn usage_errors_are_caught_by_clap() {
        assert!(cli().try_get_matches_from([PROGRAM_NAME]).is_err());
        assert!(cli()
            .try_get_matches_from([PROGRAM_NAME, "revoke", "batch.json"])
            .is_err());
        let args = cli()
            .try_get_matches_from([PROGRAM_NAME, "tabulate"])
            .unwrap();
        let (_, sub) = args.subcommand().unwrap();
        assert_eq!(parse_election(sub).unwrap(), None);
    }

    #[test]
    fn bad_election_ids_are_refused() {
        let args = cli()
            .try_get_matches_from([PROGRAM_NAME, "rollback", "../phase"])
            .unwrap();
        let (_, sub) = args.subcommand().unwrap();
        assert!(matches!(parse_election(sub), Err(CliError::Refused(_))));
    }
}
