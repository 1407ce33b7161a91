//! muster-authd - Agent Enrollment Daemon
//!
//! Long-running daemon that accepts TLS connections from prospective
//! agents, validates enrollment requests, assigns stable agent identifiers,
//! mints shared secrets, and persists the keystore durably while keeping
//! the agents database in sync.
//!
//! # Stages
//!
//! Up to four long-lived tasks run concurrently:
//! - **accept**: owns the listening socket, feeds the bounded client queue
//! - **dispatch**: TLS handshake, protocol parse, validation, key
//!   allocation (or forwarding to the master on worker nodes)
//! - **writer**: flushes the keystore and journal to disk and to the
//!   agents database (master nodes only)
//! - **signals**: flips the shared running flag on SIGTERM/SIGINT/SIGHUP
//!
//! Shutdown is cooperative: every stage re-checks the running flag at each
//! suspension point, so the daemon winds down within about a second of the
//! signal. Stages are joined accept-first, then dispatch, then the writer
//! after one final wakeup so it can drain the journal.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use muster_core::config::AuthdConfig;
use muster_core::keystore::KeyStore;
use muster_authd::agents_db::AgentsDb;
use muster_authd::cluster::MasterChannel;
use muster_authd::service::AuthService;
use muster_authd::{accept, dispatch, tls, writer};
use rand::Rng;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// muster agent enrollment daemon
#[derive(Parser, Debug)]
#[command(name = "muster-authd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/muster/authd.toml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(short = 't', long)]
    test_config: bool,

    /// Enrollment port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Require the enrollment password
    #[arg(short = 'P', long)]
    use_password: bool,

    /// CA bundle used to verify agent certificates (overrides the config
    /// file)
    #[arg(short = 'v', long)]
    agent_ca: Option<PathBuf>,

    /// With a CA bundle, require agent certificates to name their source
    /// address
    #[arg(short = 's', long)]
    verify_host: bool,

    /// Server certificate path (overrides the config file)
    #[arg(short = 'x', long)]
    server_cert: Option<PathBuf>,

    /// Server private key path (overrides the config file)
    #[arg(short = 'k', long)]
    server_key: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Merges CLI overrides into the file configuration.
fn apply_overrides(config: &mut AuthdConfig, args: &Args) {
    if let Some(port) = args.port {
        config.authd.port = port;
    }
    if args.use_password {
        config.authd.password.enabled = true;
    }
    if let Some(ca) = &args.agent_ca {
        config.authd.tls.agent_ca = Some(ca.clone());
    }
    if args.verify_host {
        config.authd.tls.verify_host = true;
    }
    if let Some(cert) = &args.server_cert {
        config.authd.tls.server_cert.clone_from(cert);
    }
    if let Some(key) = &args.server_key {
        config.authd.tls.server_key.clone_from(key);
    }
}

/// Reads the enrollment password from its file, or generates a random one.
///
/// The original file contents are used only when they hold more than two
/// characters on the first line; anything shorter falls back to a random
/// password, which is logged so the operator can hand it to agents.
fn resolve_password(config: &AuthdConfig) -> Option<String> {
    if !config.authd.password.enabled {
        info!(
            "Accepting connections on port {}. No password required.",
            config.authd.port
        );
        return None;
    }

    let from_file = std::fs::read_to_string(&config.authd.password.file)
        .ok()
        .and_then(|contents| {
            let line = contents.lines().next().unwrap_or("").trim().to_string();
            (line.len() > 2).then_some(line)
        });

    match from_file {
        Some(password) => {
            info!(
                "Accepting connections on port {}. Using password specified on file: {}",
                config.authd.port,
                config.authd.password.file.display()
            );
            Some(password)
        },
        None => {
            let password: String = rand::thread_rng()
                .sample_iter(&rand::distributions::Alphanumeric)
                .take(16)
                .map(char::from)
                .collect();
            info!(
                "Accepting connections on port {}. Random password chosen for agent authentication: {}",
                config.authd.port, password
            );
            Some(password)
        },
    }
}

/// Loads the keystore and its timestamp sidecar, making sure the key file
/// is writable first. Master nodes only.
fn load_keystore(config: &AuthdConfig) -> Result<KeyStore> {
    let keys_file = &config.authd.keys_file;
    if let Some(parent) = keys_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("unable to create {}", parent.display()))?;
    }
    std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(keys_file)
        .with_context(|| format!("unable to open key file {}", keys_file.display()))?;

    let mut keystore = KeyStore::load(keys_file).context("unable to load key file")?;
    keystore
        .load_timestamps(&config.authd.timestamps_file)
        .context("unable to load timestamp file")?;

    info!(agents = keystore.len(), "keystore loaded");
    Ok(keystore)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // Install the rustls crypto provider before any TLS configuration is
    // built.
    rustls::crypto::ring::default_provider().install_default().ok();

    // Load configuration; a missing file means defaults, CLI flags win.
    let mut config = if args.config.exists() {
        AuthdConfig::from_file(&args.config).context("failed to load configuration")?
    } else {
        info!("No config file found at {:?}, using defaults", args.config);
        AuthdConfig::default()
    };
    apply_overrides(&mut config, &args);
    config.validate().context("configuration rejected")?;

    if args.test_config {
        info!("Configuration OK");
        return Ok(());
    }

    let worker_node = config.worker_node();
    info!(
        "muster-authd started (pid: {}, role: {})",
        std::process::id(),
        if worker_node { "worker" } else { "master" }
    );

    // Master nodes own the keystore; workers forward everything.
    let keystore = if worker_node {
        KeyStore::new()
    } else {
        load_keystore(&config)?
    };

    let acceptor = if config.authd.remote_enrollment {
        Some(tls::build_acceptor(&config.authd.tls).context("unable to build TLS context")?)
    } else {
        None
    };

    let password = if config.authd.remote_enrollment {
        resolve_password(&config)
    } else {
        None
    };

    let service = Arc::new(AuthService::new(
        config.clone(),
        keystore,
        acceptor,
        password,
    ));

    // Accept + dispatch stages, when the enrollment port is enabled.
    let (accept_task, dispatch_task) = if config.authd.remote_enrollment {
        let bind_addr: SocketAddr = if config.authd.ipv6 {
            (Ipv6Addr::UNSPECIFIED, config.authd.port).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, config.authd.port).into()
        };
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("unable to bind enrollment port {}", config.authd.port))?;

        let master = worker_node.then(|| MasterChannel::new(config.cluster.master_socket.clone()));
        let (queue_tx, queue_rx) = mpsc::channel(config.authd.pool_size);

        let accept_task = tokio::spawn(accept::run(Arc::clone(&service), listener, queue_tx));
        let dispatch_task = tokio::spawn(dispatch::run(Arc::clone(&service), queue_rx, master));
        (Some(accept_task), Some(dispatch_task))
    } else {
        info!("Port {} was set as disabled.", config.authd.port);
        (None, None)
    };

    // Writer stage: master nodes only.
    let writer_task = (!worker_node).then(|| {
        let db = AgentsDb::new(config.agents_db.socket.clone());
        tokio::spawn(writer::run(Arc::clone(&service), db))
    });

    // Signal task: only the main flow reacts to signals; the stages just
    // watch the running flag.
    let signal_service = Arc::clone(&service);
    let signal_task = tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        let mut sighup = signal(SignalKind::hangup()).expect("failed to register SIGHUP");

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sighup.recv() => info!("Received SIGHUP"),
        }

        signal_service.request_shutdown();
    });

    signal_task.await.context("signal task failed")?;

    // Join order: accept first, then dispatch, then the writer after one
    // final wakeup so it drains whatever the last dispatches committed.
    if let Some(task) = accept_task {
        if let Err(e) = task.await {
            warn!(error = %e, "accept stage join failed");
        }
    }
    if let Some(task) = dispatch_task {
        if let Err(e) = task.await {
            warn!(error = %e, "dispatch stage join failed");
        }
    }
    if let Some(task) = writer_task {
        service.notify_writer();
        if let Err(e) = task.await {
            warn!(error = %e, "writer stage join failed");
        }
    }

    info!("Exiting...");
    Ok(())
}
