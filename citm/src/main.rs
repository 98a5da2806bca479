mod config;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nix::{sys::signal, unistd::Pid};
use tokio::sync::{mpsc, watch};

use citm_proto::server::{Citm, CitmConfig};
use citm_proto::status::{self, CitmStatus, StatusMaj, StatusMin, Tri};

use config::*;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    #[clap(short, long, env = "CITM_CONFIG", default_value = "citm.toml")]
    /// Path to the main configuration file
    config_file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the encrypting IMAP proxy
    Daemon,
    /// Ask a running daemon to re-check its configuration
    Reload {
        #[clap(short, long, env = "CITM_PID")]
        pid: i32,
    },
    /// Query the running daemon over the status socket
    Status {
        /// Request a configuration re-check and wait for the result
        #[clap(long)]
        check: bool,
    },
    /// Generate an account keypair
    Keygen {
        #[clap(short, long)]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Command::Daemon => daemon(read_config(args.config_file)?),
        Command::Status { check } => status_cmd(read_config(args.config_file)?, check),
        Command::Reload { pid } => {
            signal::kill(Pid::from_raw(pid), signal::Signal::SIGHUP)
                .context("sending SIGHUP")?;
            Ok(())
        }
        Command::Keygen { out } => keygen(out),
    }
}

fn keygen(out: PathBuf) -> Result<()> {
    if out.exists() {
        bail!("refusing to overwrite {}", out.display());
    }
    println!("generating a {}-bit key...", citm_crypto::keypair::KEY_BITS);
    let kp = citm_crypto::Keypair::generate(citm_crypto::keypair::KEY_BITS)?;
    kp.save(&out)?;
    println!("wrote {}", out.display());
    println!("fingerprint: {}", kp.fingerprint());
    Ok(())
}

fn status_cmd(config: Config, check: bool) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let sock = config.status_sock();
    let status = rt.block_on(async {
        if check {
            status::request_check(&sock).await
        } else {
            status::fetch(&sock).await
        }
    })?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn version_part(s: &str) -> u32 {
    s.parse().unwrap_or(0)
}

/// What we can honestly report without an ACME manager: either the
/// operator gave us a certificate or they did not.
fn current_status(config: &Config) -> CitmStatus {
    let (maj, tls_ready) = match &config.tls {
        Some(tls) if tls.cert.exists() && tls.key.exists() => (StatusMaj::ManualCert, Tri::Yes),
        Some(_) => (StatusMaj::NeedConf, Tri::No),
        None => (StatusMaj::NoTls, Tri::Na),
    };
    CitmStatus {
        version_maj: version_part(env!("CARGO_PKG_VERSION_MAJOR")),
        version_min: version_part(env!("CARGO_PKG_VERSION_MINOR")),
        version_patch: version_part(env!("CARGO_PKG_VERSION_PATCH")),
        fulldomain: config.fulldomain.clone(),
        status_maj: maj,
        status_min: StatusMin::None,
        configured: Tri::Yes,
        tls_ready,
    }
}

fn daemon(config: Config) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(daemon_inner(config))
}

async fn daemon_inner(config: Config) -> Result<()> {
    std::fs::create_dir_all(&config.state_root)
        .with_context(|| format!("creating {}", config.state_root.display()))?;

    let citm = Citm::new(CitmConfig {
        listen_addr: config.imap.listen_addr,
        upstream_addr: config.upstream.addr.clone(),
        upstream_host: config.upstream_host(),
        upstream_insecure: config.upstream.insecure,
        trust_ca: config.upstream.trust_ca.clone(),
        tls: config.tls.as_ref().map(|t| (t.cert.clone(), t.key.clone())),
        starttls: config.tls.as_ref().map(|t| t.starttls).unwrap_or(false),
        state_root: config.state_root.clone(),
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (status_tx, status_rx) = watch::channel(current_status(&config));
    let (check_tx, mut check_rx) = mpsc::channel::<()>(8);

    let status_task = tokio::spawn(status::serve(
        config.status_sock(),
        status_rx,
        check_tx,
        shutdown_rx.clone(),
    ));
    let proxy_task = tokio::spawn(citm.run(shutdown_rx));

    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
            _ = sighup.recv() => {
                tracing::info!("SIGHUP: re-checking configuration");
                let _ = status_tx.send(current_status(&config));
            }
            _ = check_rx.recv() => {
                tracing::info!("status client requested a check");
                let _ = status_tx.send(current_status(&config));
            }
        }
    }

    tracing::info!("shutting down");
    shutdown_tx.send(true).ok();
    let _ = proxy_task.await;
    let _ = status_task.await;
    Ok(())
}
