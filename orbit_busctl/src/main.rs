//! # Orbit Bus Control
//!
//! Operator tool for a running record bus: validates the role table, lists
//! and dumps records, drives the restart handshake by hand, captures and
//! recovers backups, and sweeps orphaned stage files.
//!
//! # Usage
//!
//! ```bash
//! # Validate the role table
//! orbit_busctl --config config/bus.toml check
//!
//! # Inspect records
//! orbit_busctl list
//! orbit_busctl --json dump engineering
//!
//! # Restart handshake
//! orbit_busctl signal
//! orbit_busctl request piloting --target engineering
//! orbit_busctl ack engineering
//! orbit_busctl reset piloting
//! orbit_busctl reset other --force
//!
//! # Follow a record as a given role until Ctrl-C
//! orbit_busctl watch engineering --role piloting
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use orbit_common::config::{OrbitConfig, SharedConfig};
use orbit_common::consts::DEFAULT_CONFIG_PATH;
use orbit_common::role::ProcessRole;
use orbit_common::schema::RecordSchema;
use orbit_common::table::{RoleTable, participating_roles};
use orbit_record_bus::{
    BackupCoordinator, Freshness, Generation, Participant, RecordDiscovery, RecordStore,
    RestartSignalChannel, StageCleanup,
};
use thiserror::Error;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Orbit record bus control
#[derive(Parser, Debug)]
#[command(name = "orbit_busctl")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Inspect and operate the Orbit shared record bus")]
#[command(long_about = None)]
struct Args {
    /// Path to the bus configuration (role table and [bus] section)
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration and print the role table
    Check,
    /// List record files in the bus directory
    List,
    /// Print the latest snapshot of a record
    Dump {
        /// Record name
        record: String,
    },
    /// Print the restart signal
    Signal,
    /// Request a restart
    Request {
        /// Requesting role
        role: ProcessRole,
        /// Role asked to restart; any role may acknowledge when omitted
        #[arg(long)]
        target: Option<ProcessRole>,
    },
    /// Acknowledge a pending restart
    Ack {
        /// Acknowledging role
        role: ProcessRole,
    },
    /// Return the restart signal to normal
    Reset {
        /// Requester closing the cycle
        role: ProcessRole,
        /// Rewrite the signal regardless of its state
        #[arg(long)]
        force: bool,
    },
    /// Capture a backup of a record now
    Backup {
        /// Record name
        record: String,
    },
    /// Print the backed-up snapshot of a record
    Recover {
        /// Record name
        record: String,
    },
    /// Poll a record as a role and report changes until interrupted
    Watch {
        /// Record name
        record: String,
        /// Role to poll as; must subscribe to the record
        #[arg(long)]
        role: ProcessRole,
    },
    /// Remove orphaned stage files
    Sweep,
}

#[derive(Error, Debug)]
enum CliError {
    #[error("record '{0}' is not declared in the configuration")]
    UnknownRecord(String),
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = OrbitConfig::load_validated(&args.config);
    setup_tracing(&args, config.as_ref().ok().map(|c| &c.shared));

    let result = match config {
        Ok(config) => run(&args, &config, &mut std::io::stdout().lock()),
        Err(e) => Err(e.into()),
    };
    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run(args: &Args, config: &OrbitConfig, out: &mut impl Write) -> CliResult<()> {
    let table = config.role_table()?;
    info!(config = %args.config.display(), records = table.len(), "configuration loaded");

    match &args.command {
        Command::Check => check(args, config, &table, out),
        Command::List => list(args, config, out),
        Command::Dump { record } => dump(args, config, &table, record, out),
        Command::Signal => {
            let signal = RestartSignalChannel::from_config(&config.bus)?.current()?;
            if args.json {
                writeln!(out, "{}", serde_json::to_string_pretty(&signal)?)?;
            } else {
                writeln!(out, "{signal}")?;
            }
            Ok(())
        }
        Command::Request { role, target } => {
            let outcome = RestartSignalChannel::from_config(&config.bus)?.request(*role, *target)?;
            writeln!(out, "{outcome:?}")?;
            Ok(())
        }
        Command::Ack { role } => {
            RestartSignalChannel::from_config(&config.bus)?.acknowledge(*role)?;
            writeln!(out, "acknowledged by {role}")?;
            Ok(())
        }
        Command::Reset { role, force } => {
            let channel = RestartSignalChannel::from_config(&config.bus)?;
            if *force {
                channel.force_reset(*role)?;
            } else {
                channel.reset(*role)?;
            }
            writeln!(out, "{}", channel.current()?)?;
            Ok(())
        }
        Command::Backup { record } => {
            let store = RecordStore::from_config(&config.bus, schema(&table, record)?)?;
            let outcome = BackupCoordinator::from_config(&config.bus)?.capture(&store)?;
            writeln!(out, "{record}: {outcome:?}")?;
            Ok(())
        }
        Command::Recover { record } => {
            let schema = schema(&table, record)?;
            let backup = BackupCoordinator::from_config(&config.bus)?
                .recover(&schema)?
                .accept();
            let mut json = backup.to_json(&schema);
            json["captured_at_ns"] = serde_json::json!(
                backup
                    .captured_at()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0)
            );
            writeln!(out, "{}", serde_json::to_string_pretty(&json)?)?;
            Ok(())
        }
        Command::Watch { record, role } => watch(config, &table, record, *role, out),
        Command::Sweep => {
            let report = StageCleanup::from_config(&config.bus).sweep_bus(&config.bus)?;
            writeln!(out, "removed {} stage file(s), kept {}", report.removed, report.kept)?;
            Ok(())
        }
    }
}

fn schema(table: &RoleTable, record: &str) -> CliResult<Arc<RecordSchema>> {
    table
        .schema(record)
        .cloned()
        .ok_or_else(|| CliError::UnknownRecord(record.to_string()).into())
}

fn check(args: &Args, config: &OrbitConfig, table: &RoleTable, out: &mut impl Write) -> CliResult<()> {
    if args.json {
        let records: Vec<_> = table
            .schemas()
            .map(|s| {
                serde_json::json!({
                    "name": s.name(),
                    "fields": s.fields().len(),
                    "payload_len": s.payload_len(),
                    "layout_hash": format!("{:08x}", s.layout_hash()),
                    "critical": s.is_critical(),
                    "owners": s.owners().iter().map(|r| r.as_str()).collect::<Vec<_>>(),
                })
            })
            .collect();
        writeln!(out, "{}", serde_json::to_string_pretty(&records)?)?;
        return Ok(());
    }

    writeln!(out, "bus directory: {}", config.bus.dir.display())?;
    for s in table.schemas() {
        let owners: Vec<_> = s.owners().iter().map(|r| r.as_str()).collect();
        writeln!(
            out,
            "{:<16} {:>4} fields  {:>6} bytes  hash {:08x}  owners [{}]{}",
            s.name(),
            s.fields().len(),
            s.payload_len(),
            s.layout_hash(),
            owners.join(", "),
            if s.is_critical() { "  critical" } else { "" }
        )?;
    }
    let participants: Vec<_> = participating_roles(table).iter().map(|r| r.as_str()).collect();
    writeln!(out, "participants [{}]", participants.join(", "))?;
    for role in ProcessRole::ALL {
        let subscribed: Vec<_> = table.subscriptions(role).map(|s| s.name()).collect();
        if !subscribed.is_empty() {
            writeln!(out, "{role} reads [{}]", subscribed.join(", "))?;
        }
    }
    Ok(())
}

fn list(args: &Args, config: &OrbitConfig, out: &mut impl Write) -> CliResult<()> {
    let records = RecordDiscovery::list(&config.bus.dir)?;
    if args.json {
        writeln!(out, "{}", serde_json::to_string_pretty(&records)?)?;
        return Ok(());
    }
    for r in &records {
        match &r.error {
            Some(e) => writeln!(out, "{:<16} {:>8} bytes  INVALID: {e}", r.name, r.size)?,
            None => writeln!(
                out,
                "{:<16} {:>8} bytes  {}  by {}{}",
                r.name,
                r.size,
                Generation::new(r.generation),
                r.publisher.map_or("-", ProcessRole::as_str),
                if r.co_owned { "  co-owned" } else { "" }
            )?,
        }
    }
    Ok(())
}

fn dump(
    args: &Args,
    config: &OrbitConfig,
    table: &RoleTable,
    record: &str,
    out: &mut impl Write,
) -> CliResult<()> {
    let schema = schema(table, record)?;
    let store = RecordStore::from_config(&config.bus, Arc::clone(&schema))?;
    let snapshot = store.read_latest()?;
    if args.json {
        writeln!(out, "{}", serde_json::to_string_pretty(&snapshot.to_json(&schema))?)?;
        return Ok(());
    }
    writeln!(
        out,
        "{} {} published by {}",
        snapshot.record(),
        snapshot.generation(),
        snapshot.published_by()
    )?;
    for field in schema.fields() {
        match snapshot.value(field.index) {
            Some(value) => writeln!(out, "  {:>4} {:<24} {value}", field.index, field.name)?,
            None => writeln!(out, "  {:>4} {:<24} -", field.index, field.name)?,
        }
    }
    Ok(())
}

fn watch(
    config: &OrbitConfig,
    table: &RoleTable,
    record: &str,
    role: ProcessRole,
    out: &mut impl Write,
) -> CliResult<()> {
    let interval = schema(table, record)?.timing().expected_interval;
    let mut participant = Participant::new(role, table, &config.bus)?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        flag.store(false, Ordering::SeqCst);
    })?;

    let mut last: Option<(Generation, Freshness)> = None;
    while running.load(Ordering::SeqCst) {
        match participant.poll(record) {
            Ok(observation) => {
                let current = (observation.snapshot.generation(), observation.freshness);
                if last != Some(current) {
                    writeln!(
                        out,
                        "{record} {} {} ({:?})",
                        current.0, current.1, observation.source
                    )?;
                    last = Some(current);
                }
            }
            Err(e) if e.is_unreadable() => {
                if last.is_some() {
                    writeln!(out, "{record} unreadable: {e}")?;
                    last = None;
                }
            }
            Err(e) => return Err(e.into()),
        }
        std::thread::sleep(interval.min(Duration::from_millis(250)));
    }
    Ok(())
}

/// Log filter: DEBUG with `--verbose`, otherwise the configured
/// `[shared] log_level`, or WARN when the configuration did not load.
fn log_filter(args: &Args, shared: Option<&SharedConfig>) -> EnvFilter {
    match shared {
        _ if args.verbose => EnvFilter::from_default_env().add_directive(Level::DEBUG.into()),
        Some(shared) => orbit_record_bus::env_filter(shared),
        None => EnvFilter::from_default_env().add_directive(Level::WARN.into()),
    }
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args, shared: Option<&SharedConfig>) {
    let filter = log_filter(args, shared);

    if args.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
