use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use customcert::{
    CertificateStore, CustomCertConfig, DEFAULT_CONFIG_PATH, LifecycleController, QuicHost,
    RecordingHost, StartupOutcome,
};

#[derive(Parser)]
#[command(name = "customcert")]
#[command(about = "Persistent TLS identity and reverse-proxy compatibility for QUIC game servers")]
struct Cli {
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "CUSTOMCERT_CONFIG")]
    config: PathBuf,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the startup sequence against a dry-run host and report the outcome
    Check,
    /// Print the fingerprint of the configured certificate
    Fingerprint,
    /// Generate and persist a self-signed identity
    Generate {
        /// Replace existing certificate material
        #[arg(long)]
        force: bool,
    },
    /// Run the QUIC server with the persistent identity installed
    Serve {
        #[arg(short, long, default_value = "0.0.0.0:5520")]
        listen: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    let config = CustomCertConfig::load_or_create(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command {
        Command::Check => check(config),
        Command::Fingerprint => fingerprint(config),
        Command::Generate { force } => generate(config, force),
        Command::Serve { listen } => serve(config, listen).await,
    }
}

fn check(config: CustomCertConfig) -> Result<()> {
    let mut host = RecordingHost::new();
    let mut controller = LifecycleController::new(config);

    match controller.start(&mut host) {
        Ok(StartupOutcome::Active(installed)) => {
            println!("state: {}", controller.state());
            println!("fingerprint: {}", installed.identity().fingerprint());
            Ok(())
        }
        Ok(StartupOutcome::Degraded(e)) => {
            println!("state: {}", controller.state());
            println!("reason: {e}");
            Ok(())
        }
        Err(e) => {
            println!("state: {}", controller.state());
            Err(e).context("startup would fail")
        }
    }
}

fn fingerprint(config: CustomCertConfig) -> Result<()> {
    let identity = CertificateStore::new(config.store).load_existing()?;

    println!("subject: {}", identity.subject());
    println!("fingerprint: {}", identity.fingerprint());
    println!("not before: {}", format_time(identity.not_before()));
    println!("not after: {}", format_time(identity.not_after()));
    if identity.is_expired_at(SystemTime::now()) {
        warn!("Certificate has expired");
    }
    Ok(())
}

fn generate(config: CustomCertConfig, force: bool) -> Result<()> {
    let store = CertificateStore::new(config.store);
    let existing = [&store.config().cert_path, &store.config().key_path]
        .into_iter()
        .find(|path| path.exists());

    if let Some(path) = existing
        && !force
    {
        bail!("{} already exists, pass --force to replace it", path.display());
    }

    let identity = store.generate_fallback()?;
    println!("fingerprint: {}", identity.fingerprint());
    Ok(())
}

async fn serve(config: CustomCertConfig, listen: SocketAddr) -> Result<()> {
    let mut host = QuicHost::new(
        config.store.alpn_bytes(),
        config.store.fallback_subject_names.clone(),
    );
    let mut controller = LifecycleController::new(config);

    match controller.start(&mut host).context("refusing to start")? {
        StartupOutcome::Active(installed) => {
            info!("Using certificate {}", installed.identity().subject());
        }
        StartupOutcome::Degraded(e) => {
            warn!("Running with native certificate behavior: {e}");
        }
    }

    host.serve(listen).await
}

fn format_time(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%Y-%m-%d %H:%M:%S UTC")
        .to_string()
}
