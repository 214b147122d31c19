//! usb-access-control - certificate-gated USB storage access.
//!
//! Listens for USBGuard presence signals, runs every device through the
//! access-control state machine and asks USBGuard to allow or block it.
//! Storage devices are only allowed once the certificate on their signature
//! partition chains to the configured CA.

mod logging;
mod sysfs;
mod usbguard;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{debug, error, info, warn};
use usb_access_cert::{verify_pem_chain, TrustStore, WebPkiVerifier};
use usb_access_core::validation::validate_certificate_data;
use usb_access_core::{
    AccessConfig, CertificateReader, CertificateWorkflow, CertificationPolicy, Collaborators,
    DeviceClassifier, DeviceProperties, DeviceRegistry, DeviceWatchdog, EventQueue,
    FileCertificateReader, FsmEngine, LoadedConfig, LogLevel, PolicyRetry, PresenceHandler,
    PropertyClassifier, QueueEntry, TransitionTable,
};

use crate::sysfs::SysfsSignatureLocator;
use crate::usbguard::{UsbGuardListener, UsbGuardPolicy};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const LISTENER_THREAD_NAME: &str = "usbguard-listener";
const SHUTDOWN_THREAD_NAME: &str = "usb-shutdown";
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// usb-access-control - certificate-gated USB storage access.
///
/// Storage devices stay blocked until the certificate stored on their
/// USB_SIG partition verifies against the configured CA. Other devices are
/// allowed on attach. Enforcement is delegated to USBGuard.
#[derive(Parser)]
#[command(name = "usb-access-control")]
#[command(version = VERSION)]
#[command(about = "Certificate-gated USB storage access control")]
#[command(long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    format: String,

    /// CA certificate, overriding USB_ACCESS_CA_CERT_PATH
    #[arg(long, global = true)]
    ca_cert: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default)
    Run,

    /// Show the effective configuration and trust anchor
    Info,

    /// Verify a certificate file against the trust anchor
    Verify {
        /// PEM certificate, optionally followed by intermediates
        certificate: PathBuf,
    },

    /// Classify a device from its USBGuard attributes
    Classify {
        /// Attributes as key=value
        #[arg(value_parser = parse_property)]
        properties: Vec<(String, String)>,
    },

    /// Print the state transition table
    Table,
}

fn parse_property(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {s:?}"))?;
    if key.is_empty() {
        return Err(format!("empty key in {s:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let json = cli.format == "json";

    let LoadedConfig {
        mut config,
        warnings,
    } = AccessConfig::from_env();
    if let Some(ca_cert) = cli.ca_cert {
        config.trust_anchor_path = ca_cert;
    }
    if cli.verbose && config.log_level != LogLevel::Trace {
        config.log_level = LogLevel::Debug;
    }

    let command = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => return run_daemon(config, warnings).await,
        command => command,
    };

    logging::init_cli(cli.verbose);
    for warning in &warnings {
        warn!("Config: {warning}");
    }
    match command {
        Commands::Info => show_info(&config, json),
        Commands::Verify { certificate } => verify_certificate(&config, &certificate, json),
        Commands::Classify { properties } => classify(properties, json),
        Commands::Table => show_table(json),
        Commands::Run => Ok(()),
    }
}

async fn run_daemon(config: AccessConfig, warnings: Vec<String>) -> anyhow::Result<()> {
    if let Some(failure) = logging::init_daemon(config.log_level, config.log_path.as_deref()) {
        warn!(
            path = %failure.path.display(),
            error = %failure.error,
            "Logging: cannot open log file, continuing on stderr"
        );
    }
    for warning in &warnings {
        warn!("Config: {warning}");
    }
    info!(version = VERSION, "Starting USB access control");

    match TrustStore::from_pem_file(&config.trust_anchor_path) {
        Ok(store) => info!(
            path = %config.trust_anchor_path.display(),
            anchors = store.len(),
            fingerprint = store.fingerprints().first().map(String::as_str).unwrap_or_default(),
            "Trust anchor loaded"
        ),
        Err(e) => warn!(
            path = %config.trust_anchor_path.display(),
            error = %e,
            "Trust anchor unusable; storage devices will be denied"
        ),
    }

    let registry = Arc::new(DeviceRegistry::new());
    let queue = Arc::new(EventQueue::new(config.queue_capacity).context("failed to create event queue")?);

    let workflow = CertificateWorkflow::new(
        Arc::new(SysfsSignatureLocator::default()),
        Arc::new(FileCertificateReader),
        Arc::new(WebPkiVerifier::new()),
        CertificationPolicy::from(&config),
    );
    let collaborators = Collaborators {
        classifier: Arc::new(PropertyClassifier),
        enforcer: Arc::new(UsbGuardPolicy::new()),
        workflow,
    };

    let listener = UsbGuardListener::connect().context("USBGuard is not reachable")?;

    let engine = Arc::new(FsmEngine::new(
        Arc::clone(&registry),
        Arc::clone(&queue),
        collaborators,
        PolicyRetry::from(&config),
    ));
    let engine_handle = engine.spawn()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let watchdog = Arc::new(DeviceWatchdog::new(
        Arc::clone(&registry),
        Arc::clone(&queue),
        config.device_timeout,
    ));
    let watchdog_handle = watchdog.spawn(Arc::clone(&shutdown))?;

    let handler = PresenceHandler::new(Arc::clone(&registry), Arc::clone(&queue));
    let listener_shutdown = Arc::clone(&shutdown);
    let listener_handle = thread::Builder::new()
        .name(LISTENER_THREAD_NAME.into())
        .spawn(move || {
            if let Err(e) = listener.run(&handler, &listener_shutdown) {
                error!(error = %e, "USBGuard: listener failed");
            }
        })
        .context("failed to spawn listener thread")?;

    info!(
        queue_capacity = config.queue_capacity,
        device_timeout = ?config.device_timeout,
        "USB access control running"
    );

    let reason = tokio::select! {
        signal = shutdown_signal() => signal?,
        () = finished(&listener_handle) => "listener stopped",
    };
    info!(reason, "Shutting down");

    shutdown.store(true, Ordering::SeqCst);
    // EXIT may wait for queue space; the engine frees it while draining.
    let exit_queue = Arc::clone(&queue);
    thread::Builder::new()
        .name(SHUTDOWN_THREAD_NAME.into())
        .spawn(move || exit_queue.enqueue(QueueEntry::exit()))
        .context("failed to spawn shutdown thread")?;

    let deadline = Instant::now() + config.shutdown_grace;
    while !(engine_handle.is_finished() && watchdog_handle.is_finished())
        && Instant::now() < deadline
    {
        tokio::time::sleep(SHUTDOWN_POLL).await;
    }

    if engine_handle.is_finished() {
        match engine_handle.join() {
            Ok(stats) => info!(
                applied = stats.applied,
                noops = stats.noops,
                dropped = stats.dropped,
                reclaimed = stats.reclaimed,
                "Engine stopped"
            ),
            Err(_) => error!("Engine thread panicked"),
        }
    } else {
        warn!(grace = ?config.shutdown_grace, "Engine did not stop within grace period");
    }
    if !watchdog_handle.is_finished() {
        warn!("Watchdog did not stop within grace period");
    }
    if !listener_handle.is_finished() {
        debug!("Listener still waiting on the bus; abandoning it");
    }

    let freed = registry.force_cleanup_all();
    info!(freed, "Shutdown complete");
    Ok(())
}

async fn finished(handle: &JoinHandle<()>) {
    while !handle.is_finished() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for SIGINT")?;
            Ok("SIGINT")
        },
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for interrupt")?;
    Ok("interrupt")
}

fn show_info(config: &AccessConfig, json: bool) -> anyhow::Result<()> {
    let anchor = TrustStore::from_pem_file(&config.trust_anchor_path);

    if json {
        let anchor = match &anchor {
            Ok(store) => serde_json::json!({
                "loaded": true,
                "fingerprints": store.fingerprints(),
            }),
            Err(e) => serde_json::json!({
                "loaded": false,
                "error": e.to_string(),
            }),
        };
        let output = serde_json::json!({
            "version": VERSION,
            "config": config,
            "trust_anchor": anchor,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("\nUSB ACCESS CONTROL {VERSION}");
    println!("=========================\n");
    println!("Configuration:");
    println!("  CA certificate:      {}", config.trust_anchor_path.display());
    match &config.log_path {
        Some(path) => println!("  Log file:            {}", path.display()),
        None => println!("  Log file:            (stderr only)"),
    }
    println!("  Log level:           {}", config.log_level);
    println!("  Queue capacity:      {}", config.queue_capacity);
    println!("  Device timeout:      {:?}", config.device_timeout);
    println!("  Verify timeout:      {:?}", config.cert_verify_timeout);
    println!(
        "  Signature lookups:   {} x {:?}",
        config.sig_retry_count, config.sig_retry_delay
    );
    println!("  Signature prefixes:  {}", config.sig_path_prefixes.join(" "));
    println!("  Policy attempts:     {}", config.policy_retry_count);
    println!("  Shutdown grace:      {:?}", config.shutdown_grace);
    println!();
    println!("Trust anchor:");
    match &anchor {
        Ok(store) => {
            for fingerprint in store.fingerprints() {
                println!("  \x1b[32mOK\x1b[0m   SHA-256 {fingerprint}");
            }
        },
        Err(e) => println!("  \x1b[31mFAIL\x1b[0m {e}"),
    }
    Ok(())
}

fn verify_certificate(config: &AccessConfig, certificate: &Path, json: bool) -> anyhow::Result<()> {
    let data = FileCertificateReader
        .read(certificate)
        .with_context(|| format!("failed to read {}", certificate.display()))?;
    validate_certificate_data(&data).context("certificate rejected")?;
    let store = TrustStore::from_pem_file(&config.trust_anchor_path)?;

    let result = verify_pem_chain(&data, &store);
    if json {
        let output = match &result {
            Ok(verified) => serde_json::json!({
                "trusted": true,
                "fingerprint": verified.fingerprint,
                "intermediates": verified.intermediates,
            }),
            Err(e) => serde_json::json!({
                "trusted": false,
                "error": e.to_string(),
            }),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    }

    match result {
        Ok(verified) => {
            if !json {
                println!("\x1b[32mTRUSTED\x1b[0m  {}", certificate.display());
                println!("  SHA-256:       {}", verified.fingerprint);
                println!("  Intermediates: {}", verified.intermediates);
            }
            Ok(())
        },
        Err(e) if e.is_untrusted() => {
            if !json {
                println!("\x1b[31mUNTRUSTED\x1b[0m {}", certificate.display());
                println!("  {e}");
            }
            bail!("certificate does not chain to {}", config.trust_anchor_path.display())
        },
        Err(e) => Err(anyhow::Error::new(e).context("certificate unusable")),
    }
}

fn classify(properties: Vec<(String, String)>, json: bool) -> anyhow::Result<()> {
    let properties = DeviceProperties::from_pairs(properties);
    let storage = PropertyClassifier.is_storage(&properties);
    if json {
        let output = serde_json::json!({
            "storage": storage,
            "properties": properties,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if storage {
        println!("storage device: certificate required");
    } else {
        println!("non-storage device: allowed on attach");
    }
    Ok(())
}

fn show_table(json: bool) -> anyhow::Result<()> {
    let table = TransitionTable::standard();
    let rows = table.defined();
    if json {
        let output: Vec<_> = rows
            .iter()
            .map(|(from, event, cell)| {
                serde_json::json!({
                    "from": from,
                    "event": event,
                    "next": cell.next,
                    "action": cell.action,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{:<12} {:<26} {:<12} ACTION", "FROM", "EVENT", "NEXT");
    for (from, event, cell) in rows {
        let action = cell.action.map(|a| a.name()).unwrap_or("-");
        println!("{:<12} {:<26} {:<12} {}", from.name(), event.name(), cell.next.name(), action);
    }
    Ok(())
}
