//! CAN Analyzer CLI Application
//!
//! Runs the sessions described in a TOML file on the in-process virtual bus:
//! - Loads each session's DBC files and filters
//! - Starts the configured one-shot and periodic transmissions
//! - Optionally logs frames as JSON lines
//! - Prints a per-session report when the run ends

use anyhow::{anyhow, Context, Result};
use can_analyzer::{CanFrame, CanSession, SessionRegistry, TxRequest, VirtualBus};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod config;
mod logfile;
mod report;

use config::{SessionEntry, TxEntry};
use report::SessionReport;

/// CAN Analyzer - Run analyzer sessions on a virtual CAN bus
#[derive(Parser, Debug)]
#[command(name = "can-analyzer-cli")]
#[command(about = "Run CAN analyzer sessions described in a TOML file", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the session configuration file (session.toml)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// How long to run before stopping, in seconds
    #[arg(short, long, value_name = "SECS", default_value_t = 5.0)]
    duration: f64,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("CAN Analyzer CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using analyzer library v{}", can_analyzer::VERSION);

    if !args.duration.is_finite() || args.duration < 0.0 {
        return Err(anyhow!("--duration must be a non-negative number of seconds"));
    }

    log::info!("Loading configuration from: {:?}", args.config);
    let config = config::load_config(&args.config)?;
    log::debug!("Configuration loaded: {} sessions", config.sessions.len());

    let bus = VirtualBus::new();
    let registry = SessionRegistry::new(Arc::new(bus));

    let mut prepared = Vec::new();
    for entry in &config.sessions {
        let session = registry
            .open(entry.config.clone())
            .with_context(|| format!("Failed to open session '{}'", entry.config.name))?;
        let sink = prepare_session(&session, entry)?;
        prepared.push((session, entry, sink));
    }

    for (session, _, _) in &prepared {
        session
            .start()
            .with_context(|| format!("Failed to start session '{}'", session.name()))?;
    }
    for (session, entry, _) in &prepared {
        start_transmissions(session, &entry.tx)?;
    }

    log::info!("Running for {:.1} s", args.duration);
    std::thread::sleep(Duration::from_secs_f64(args.duration));
    registry.stop_all();

    for (session, _, sink) in &prepared {
        if let Some(sink) = sink {
            sink.stop();
        }
        let report = SessionReport::collect(session, sink.as_ref().map(|s| s.stats()));
        if !args.quiet {
            println!("{}", report.render());
        }
    }

    registry.shutdown();
    Ok(())
}

/// Load DBCs, apply filters and attach the frame log
fn prepare_session(
    session: &CanSession,
    entry: &SessionEntry,
) -> Result<Option<Arc<can_analyzer::QueuedSink>>> {
    for dbc in &entry.dbc {
        let report = session
            .load_dbc(&dbc.path, dbc.key.as_deref())
            .with_context(|| format!("Failed to load DBC {:?}", dbc.path))?;
        log::info!(
            "[{}] Loaded {:?}: {} routes, {} collisions",
            session.name(),
            dbc.path,
            report.routed,
            report.collisions.len()
        );
    }

    for filter in &entry.filter {
        session.filters().configure(filter.scope(), filter.rule.clone());
    }

    entry
        .log_file
        .as_deref()
        .map(|path| logfile::attach(session, path))
        .transpose()
}

fn build_request(session: &CanSession, tx: &TxEntry) -> Result<TxRequest> {
    if let Some(id) = tx.id {
        let frame = if tx.extended {
            CanFrame::extended(id, tx.data.clone())
        } else {
            CanFrame::new(id, tx.data.clone())
        };
        return Ok(TxRequest::raw(frame.with_fd(tx.data.len() > 8)));
    }

    let catalog_key = tx
        .catalog
        .as_deref()
        .ok_or_else(|| anyhow!("tx entry without catalog"))?;
    let message = tx
        .message
        .as_deref()
        .ok_or_else(|| anyhow!("tx entry without message"))?;
    let catalog = session
        .router()
        .catalog(catalog_key)
        .ok_or_else(|| anyhow!("catalog '{}' is not loaded", catalog_key))?;
    let key = catalog
        .message_by_name(message)
        .ok_or_else(|| anyhow!("message '{}' not found in '{}'", message, catalog_key))?
        .key;

    Ok(TxRequest::dbc(catalog_key, key, tx.signals.clone()))
}

fn start_transmissions(session: &CanSession, entries: &[TxEntry]) -> Result<()> {
    for tx in entries {
        let request = build_request(session, tx)
            .with_context(|| format!("Invalid tx entry in session '{}'", session.name()))?;
        match tx.period_ms {
            Some(period_ms) => {
                let handle = session.schedule(request, period_ms)?;
                log::info!("[{}] Started {} every {} ms", session.name(), handle, period_ms);
            }
            None => session.send(request)?,
        }
    }
    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
