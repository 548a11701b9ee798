//
// `broker-ctl` — diagnostic CLI for exercising the broker flows from a
// terminal during development. There is no web front-end in this crate, so
// this is the only way to drive a sync or an OAuth flow outside of tests.
// Argument parsing uses `pico-args`.
//

use std::collections::HashMap;
use std::sync::Arc;

use broker_core::config::CONFIG;
use broker_core::registry::Registry;
use broker_core::repository::{InMemoryAccountMappingRepository, InMemoryConnectionRepository, InMemoryHoldingsRepository, InMemorySyncHistoryRepository, InMemoryTransactionSink};
use broker_core::session::{BrokerConnection, BrokerType, Country};
use broker_core::sync::Orchestrator;
use broker_core::{oauth, util};

const HELP: &str = "\
broker-ctl — exercise the broker authentication/session subsystem

USAGE:
    broker-ctl <COMMAND> [OPTIONS]

COMMANDS:
    oauth-start --connection <id> --app-key <key> [--app-secret <secret>] --redirect-uri <uri>
        Starts a Saxo OAuth2 flow and prints the authorize URL.

    sync --connection <id>
        Runs the Saxo sync orchestrator once against an in-memory connection
        seeded for local testing.

    help
        Prints this message.
";

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), broker_core::error::Error> {
    if let Err(e) = broker_core::init_logging() {
        eprintln!("warning: failed to initialize logging: {e}");
    }

    let mut args = pico_args::Arguments::from_env();
    let command = args.subcommand().map_err(|e| broker_core::error::Error::new("failed to parse arguments", e.to_string()))?;

    match command.as_deref() {
        Some("oauth-start") => cmd_oauth_start(args),
        Some("sync") => cmd_sync(args),
        Some("help") | None => {
            println!("{HELP}");
            Ok(())
        }
        Some(other) => {
            eprintln!("unknown command `{other}`\n\n{HELP}");
            std::process::exit(2);
        }
    }
}

fn cmd_oauth_start(mut args: pico_args::Arguments) -> Result<(), broker_core::error::Error> {
    let connection_id: String = args.value_from_str("--connection").map_err(arg_err)?;
    let app_key: String = args.value_from_str("--app-key").map_err(arg_err)?;
    let app_secret: Option<String> = args.opt_value_from_str("--app-secret").map_err(arg_err)?;
    let redirect_uri: String = args.value_from_str("--redirect-uri").map_err(arg_err)?;

    let connection = BrokerConnection {
        id: connection_id.clone(),
        user_id: "cli".to_string(),
        broker_type: BrokerType::Saxo,
        country: None,
        username: None,
        cpr: None,
        app_key: Some(app_key),
        app_secret,
        redirect_uri: Some(redirect_uri),
        last_sync_status: None,
        last_sync_error: None,
    };
    connection.validate()?;

    let registry = Registry::new();
    oauth::start(&registry, &CONFIG, &connection)?;

    println!("Authorize URL: {}", registry.get_oauth_url(&connection_id));
    println!("Open that URL, approve access, and the loopback listener will receive the callback.");

    let rt = tokio::runtime::Runtime::new().map_err(|e| broker_core::error::Error::new("failed to start async runtime", e.to_string()))?;
    rt.block_on(oauth::run_flow(registry.clone(), clone_config(), connection_id.clone()));

    match registry.get_oauth_status(&connection_id).as_deref() {
        Some("complete") => println!("OAuth flow completed."),
        other => println!("OAuth flow ended with status: {:?}", other),
    }

    Ok(())
}

fn cmd_sync(mut args: pico_args::Arguments) -> Result<(), broker_core::error::Error> {
    let connection_id: String = args.value_from_str("--connection").map_err(arg_err)?;

    let connection = BrokerConnection {
        id: connection_id.clone(),
        user_id: "cli".to_string(),
        broker_type: BrokerType::Nordnet,
        country: Some(Country::Dk),
        username: Some("demo-user".to_string()),
        cpr: Some("0101900000".to_string()),
        app_key: None,
        app_secret: None,
        redirect_uri: None,
        last_sync_status: None,
        last_sync_error: None,
    };

    let orchestrator = Orchestrator {
        registry: Registry::new(),
        config: clone_config(),
        connections: Arc::new(InMemoryConnectionRepository::new(vec![connection])),
        mappings: Arc::new(InMemoryAccountMappingRepository::new(HashMap::new())),
        holdings: Arc::new(InMemoryHoldingsRepository::default()),
        history: Arc::new(InMemorySyncHistoryRepository::default()),
        transactions: Arc::new(InMemoryTransactionSink::default()),
    };

    let rt = tokio::runtime::Runtime::new().map_err(|e| broker_core::error::Error::new("failed to start async runtime", e.to_string()))?;
    let started = util::now();
    rt.block_on(orchestrator.sync_nordnet_connection(&connection_id))?;
    println!("Sync finished in {}ms", (util::now() - started).num_milliseconds());

    Ok(())
}

fn arg_err(e: pico_args::Error) -> broker_core::error::Error {
    broker_core::error::Error::new("invalid command-line arguments", e.to_string())
}

/// `Config` is read-only after `load()`; cloning the environment snapshot
/// rather than sharing `&'static CONFIG` keeps `Orchestrator` free of a
/// lifetime parameter.
fn clone_config() -> broker_core::config::Config {
    broker_core::config::Config::load().expect("CONFIG already validated at process start")
}
