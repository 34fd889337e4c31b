//! Iris trust CLI - inspect device identity, attestation, session and update state.
//!
//! This binary exercises the same code paths the desktop client uses, so an
//! operator can see exactly what a machine would report.

use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use iris_trust::config::{API_URL_ENV, CLIENT_SECRET_ENV, REQUEST_SECRET_ENV};
use iris_trust::{
    AutoAccept, EncryptedFileStore, HardwareIdentity, HeartbeatService, IntegrityAttestor, NeverUpdate,
    ProcessExit, ReportOutcome, SecretString, SecureChannel, SessionManager, SystemInstallerLauncher, TrustConfig, TrustError,
    UpdateCheckOutcome, UpdateManager, UpdateManifest, UpdatePrompt, VerificationOutcome,
};
use serde::Serialize;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Iris device-trust diagnostics.
#[derive(Parser)]
#[command(name = "iris-trust")]
#[command(version = VERSION)]
#[command(about = "Device-trust diagnostics for the Iris client")]
#[command(long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// API base URL
    #[arg(long, env = API_URL_ENV)]
    api: Option<String>,

    /// Request-signing secret
    #[arg(long, env = REQUEST_SECRET_ENV, hide_env_values = true)]
    request_secret: Option<String>,

    /// Client-authenticity secret
    #[arg(long, env = CLIENT_SECRET_ENV, hide_env_values = true)]
    client_secret: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the hardware fingerprint and TPM availability
    Hwid,

    /// Build a full security attestation
    Attest,

    /// Collect the OS security posture only
    Posture,

    /// Inspect or clear the stored session
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Report security posture for the stored session
    Heartbeat {
        /// Send a single report and exit instead of running the keep-alive loop
        #[arg(long)]
        once: bool,
    },

    /// Query the update service
    Update {
        #[command(subcommand)]
        action: UpdateAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Re-verify the stored session against the server
    Verify,
    /// Remove the stored session
    Logout,
}

#[derive(Subcommand)]
enum UpdateAction {
    /// Check for a newer build
    Check {
        /// Download, verify and launch the update if one is available
        #[arg(long)]
        install: bool,
    },
}

fn build_config(cli: &Cli) -> TrustConfig {
    let mut config = TrustConfig::default();
    if let Some(api) = &cli.api {
        config.api_base_url = api.clone();
    }
    if let Some(secret) = &cli.request_secret {
        config.request_secret = SecretString::new(secret.clone());
    }
    if let Some(secret) = &cli.client_secret {
        config.client_secret = SecretString::new(secret.clone());
    }
    config
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("Failed to serialize output: {e}"),
    }
}

/// Text rendering of an available update.
fn manifest_lines(m: &UpdateManifest) -> Vec<String> {
    let mut lines = vec![
        format!("  Available:       {}{}", m.version, if m.mandatory { " (mandatory)" } else { "" }),
        format!("  Download:        {}", m.download_url),
        format!("  SHA-256:         {}", m.file_hash),
    ];
    if let Some(size) = m.file_size {
        lines.push(format!("  Size:            {size} bytes"));
    }
    if !m.changelog.trim().is_empty() {
        lines.push(String::new());
        lines.push(m.changelog.trim_end().to_string());
    }
    lines
}

fn flag(on: bool) -> &'static str {
    if on {
        "\x1b[32m[YES]\x1b[0m"
    } else {
        "\x1b[33m[NO]\x1b[0m"
    }
}

async fn run_hwid(config: &TrustConfig, format: Format) {
    let identity = HardwareIdentity::system(config.identity_config());
    let (fingerprint, tpm) = tokio::join!(identity.hardware_id(), identity.check_tpm_availability());

    if format == Format::Json {
        print_json(&serde_json::json!({
            "hardwareId": fingerprint.hash,
            "kind": fingerprint.kind.as_str(),
            "tpmAvailable": tpm,
        }));
        return;
    }

    println!("HARDWARE IDENTITY");
    println!("=================\n");
    println!("  Hardware ID: {}", fingerprint.hash);
    println!("  Anchor:      {}", fingerprint.kind.as_str());
    println!("  TPM 2.0:     {}", flag(tpm));
}

async fn run_posture(config: &TrustConfig, format: Format) {
    let report = IntegrityAttestor::system(config).security_posture().await;

    if format == Format::Json {
        print_json(&report);
        return;
    }

    let p = &report.parsed;
    println!("SECURITY POSTURE");
    println!("================\n");
    println!("  TPM present:          {}", flag(p.tpm.present));
    println!("  TPM enabled:          {}", flag(p.tpm.enabled));
    if let Some(version) = &p.tpm.version {
        println!("  TPM version:          {version}");
    }
    println!("  Secure Boot:          {}", flag(p.secure_boot));
    println!("  Virtualization:       {}", flag(p.virtualization));
    println!("  VBS:                  {}", flag(p.vbs));
    println!("  HVCI:                 {}", flag(p.hvci));
    println!("  IOMMU / DMA guard:    {}", flag(p.iommu));
    println!("  Defender:             {}", flag(p.defender));
    println!("  Defender real-time:   {}", flag(p.defender_realtime));
    println!("  Disk encryption:      {}", flag(p.disk_encryption));
    println!();
    println!("  Probe digests:");
    for (signal, hash) in &report.hashes {
        println!("    {:<16} {}", signal.as_str(), hash);
    }
}

async fn run_attest(config: &TrustConfig, format: Format) {
    let attestation = IntegrityAttestor::system(config).create_attestation().await;

    if format == Format::Json {
        print_json(&attestation);
        return;
    }

    println!("SECURITY ATTESTATION");
    println!("====================\n");
    println!("  Timestamp:          {}", attestation.timestamp);
    println!("  PID:                {}", attestation.process.pid);
    println!("  Executable:         {}", attestation.process.exec_path);
    println!("  Code hash:          {}", attestation.integrity.combined);
    for (file, hash) in &attestation.integrity.files {
        println!("    {file}: {hash}");
    }
    println!("  Debugger attached:  {}", flag(attestation.debug_checks.debugger_attached));
    println!("  Suspicious tools:   {}", flag(attestation.debug_checks.suspicious_process));
    for tool in &attestation.debug_checks.tools_seen {
        println!("    - {tool}");
    }
    println!("  Timing anomaly:     {}", flag(attestation.debug_checks.time_anomaly));
    println!("  Verification token: {}", attestation.verification_token);
    println!("  Attestation hash:   {}", attestation.attestation_hash);
}

async fn session_manager(config: &TrustConfig) -> Result<SessionManager, TrustError> {
    config.validate()?;
    let channel = Arc::new(SecureChannel::new(config)?);
    let store = Arc::new(EncryptedFileStore::from_config(config).await?);
    Ok(SessionManager::new(
        config,
        channel,
        HardwareIdentity::system(config.identity_config()),
        store,
    ))
}

async fn run_heartbeat(config: &TrustConfig, format: Format, once: bool) -> Result<(), TrustError> {
    let sessions = session_manager(config).await?;
    let service = HeartbeatService::new(
        config,
        Arc::new(SecureChannel::new(config)?),
        HardwareIdentity::system(config.identity_config()),
        IntegrityAttestor::system(config),
    );

    if !once {
        // The sender lives until the process is interrupted.
        let (_shutdown, rx) = tokio::sync::watch::channel(false);
        service.run(&sessions, rx).await;
        return Ok(());
    }

    let Some(session) = sessions.current().await? else {
        if format == Format::Json {
            print_json(&serde_json::json!({ "status": "no_session" }));
        } else {
            println!("No stored session.");
        }
        return Ok(());
    };
    let changes = match service.report(&session.token, true).await? {
        ReportOutcome::Sent { changes } => changes,
        ReportOutcome::Unchanged => Vec::new(),
    };
    if format == Format::Json {
        print_json(&serde_json::json!({
            "status": "reported",
            "scanMode": service.scan_mode(),
            "securityChanges": changes,
        }));
    } else {
        println!("  \x1b[32m[OK]\x1b[0m Posture reported");
        println!("  Scan mode: {}", flag(service.scan_mode()));
    }
    Ok(())
}

async fn run_session_verify(config: &TrustConfig, format: Format) -> Result<(), TrustError> {
    let outcome = session_manager(config).await?.verify().await;

    let (status, detail) = match &outcome {
        VerificationOutcome::NoSession => ("no_session", None),
        VerificationOutcome::TpmBlocked { remediation } => ("tpm_blocked", Some(remediation.clone())),
        VerificationOutcome::HardwareMismatch { stored, observed } => (
            "hardware_mismatch",
            Some(format!("stored {stored}, observed {observed}")),
        ),
        VerificationOutcome::Success { profile } => ("valid", Some(format!("{} ({})", profile.username, profile.id))),
        VerificationOutcome::AuthRejected { reason } => ("rejected", reason.clone()),
        VerificationOutcome::Unreachable { message } => ("unreachable", Some(message.clone())),
        VerificationOutcome::OtherServerError { reason, .. } => ("server_error", Some(reason.clone())),
    };

    if format == Format::Json {
        print_json(&serde_json::json!({
            "status": status,
            "detail": detail,
            "sessionCleared": outcome.clears_session(),
        }));
        return Ok(());
    }

    println!("SESSION");
    println!("=======\n");
    if outcome.is_valid() {
        println!("  \x1b[32m[PASS]\x1b[0m Session is valid");
    } else {
        println!("  \x1b[31m[FAIL]\x1b[0m Session status: {status}");
    }
    if let Some(detail) = detail {
        println!("  {detail}");
    }
    if outcome.clears_session() {
        println!("  The stored session has been removed.");
    }
    Ok(())
}

async fn run_session_logout(config: &TrustConfig, format: Format) -> Result<(), TrustError> {
    session_manager(config).await?.logout().await?;
    if format == Format::Json {
        print_json(&serde_json::json!({ "status": "logged_out" }));
    } else {
        println!("Session cleared.");
    }
    Ok(())
}

async fn run_update_check(config: &TrustConfig, format: Format, install: bool) -> Result<(), TrustError> {
    config.validate()?;
    let channel = Arc::new(SecureChannel::new(config)?);
    let prompt: Arc<dyn UpdatePrompt> = if install {
        Arc::new(AutoAccept)
    } else {
        Arc::new(NeverUpdate)
    };
    let manager = UpdateManager::new(
        config,
        channel,
        prompt,
        Arc::new(SystemInstallerLauncher),
        Arc::new(ProcessExit),
    )?;

    if !install {
        let manifest = manager.check().await?;
        if format == Format::Json {
            print_json(&serde_json::json!({
                "currentVersion": config.client_version,
                "update": manifest,
            }));
            return Ok(());
        }
        println!("  Current version: {}", config.client_version);
        match manifest {
            Some(m) => {
                for line in manifest_lines(&m) {
                    println!("{line}");
                }
            },
            None => println!("  \x1b[32m[OK]\x1b[0m Up to date"),
        }
        return Ok(());
    }

    let outcome = manager.perform_check().await;
    if format == Format::Json {
        print_json(&serde_json::json!({
            "outcome": format!("{outcome:?}"),
            "status": format!("{:?}", manager.status()),
        }));
    } else {
        println!("  Update cycle: {outcome:?}");
    }

    if matches!(outcome, UpdateCheckOutcome::Installing | UpdateCheckOutcome::MandatoryDeclined) {
        // ProcessExit terminates the process once the grace period ends.
        std::future::pending::<()>().await;
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json_output = cli.format == Format::Json;

    // Initialize logging (quiet for JSON output)
    if json_output {
        tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::ERROR)
            .with_writer(std::io::stderr)
            .init();
    } else if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_target(false)
            .init();
    }

    let config = build_config(&cli);
    let result = match cli.command {
        Commands::Hwid => {
            run_hwid(&config, cli.format).await;
            Ok(())
        },
        Commands::Attest => {
            run_attest(&config, cli.format).await;
            Ok(())
        },
        Commands::Posture => {
            run_posture(&config, cli.format).await;
            Ok(())
        },
        Commands::Session { action } => match action {
            SessionAction::Verify => run_session_verify(&config, cli.format).await,
            SessionAction::Logout => run_session_logout(&config, cli.format).await,
        },
        Commands::Heartbeat { once } => run_heartbeat(&config, cli.format, once).await,
        Commands::Update { action } => match action {
            UpdateAction::Check { install } => run_update_check(&config, cli.format, install).await,
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e.user_message());
        if let TrustError::Config { remediation, .. } = &e {
            eprintln!("  {remediation}");
        }
        tracing::debug!(error = %e, "Command failed");
        std::process::exit(1);
    }
}
