//! `TestAuthd` helper for enrollment end-to-end tests.
//!
//! Creates an isolated daemon instance inside the test process: a fresh
//! temp directory, a self-signed server certificate, the real accept,
//! dispatch, and writer stages on an ephemeral port, and a stub agents
//! database that records every command it is sent. Worker-mode instances
//! additionally get a stub master channel.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use muster_authd::agents_db::AgentsDb;
use muster_authd::cluster::MasterChannel;
use muster_authd::service::AuthService;
use muster_authd::{accept, dispatch, tls, writer};
use muster_core::config::AuthdConfig;
use muster_core::keystore::KeyStore;
use rustls::RootCertStore;
use rustls::pki_types::ServerName;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

/// One isolated daemon instance under test.
pub struct TestAuthd {
    /// Address of the enrollment listener.
    pub addr: SocketAddr,
    /// The shared service, for direct state assertions.
    pub service: Arc<AuthService>,
    /// Path of the canonical key file.
    pub keys_file: PathBuf,
    /// Every command line the stub agents database received.
    pub db_commands: Arc<Mutex<Vec<String>>>,
    /// Every request line the stub master channel received (worker mode).
    pub master_requests: Arc<Mutex<Vec<String>>>,
    client_config: Arc<rustls::ClientConfig>,
    tasks: Vec<JoinHandle<()>>,
    #[allow(dead_code)]
    dir: TempDir,
}

impl TestAuthd {
    /// Starts a master-node daemon with default settings.
    pub async fn start() -> Self {
        Self::start_with(None, "", |_| {}).await
    }

    /// Starts a daemon with an optional enrollment password, a JSON reply
    /// for the stub master channel (worker mode only), and a configuration
    /// hook.
    pub async fn start_with(
        password: Option<&str>,
        master_reply: &str,
        adjust: impl FnOnce(&mut AuthdConfig),
    ) -> Self {
        rustls::crypto::ring::default_provider().install_default().ok();

        let dir = tempfile::tempdir().expect("failed to create temp dir");

        // Self-signed server identity for "localhost".
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("certificate generation failed");
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, cert.cert.pem()).unwrap();
        std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();

        let mut config = AuthdConfig::default();
        config.authd.keys_file = dir.path().join("agent.keys");
        config.authd.timestamps_file = dir.path().join("agents-timestamp");
        config.authd.state_dir = dir.path().join("state");
        config.authd.recv_timeout_secs = 5;
        config.authd.tls.server_cert = cert_path;
        config.authd.tls.server_key = key_path;
        config.agents_db.socket = dir.path().join("agents-db.sock");
        config.cluster.master_socket = dir.path().join("master.sock");
        adjust(&mut config);

        let db_commands = spawn_db_stub(&config.agents_db.socket).await;
        let master_requests = if config.worker_node() {
            spawn_master_stub(&config.cluster.master_socket, master_reply.to_string()).await
        } else {
            Arc::new(Mutex::new(Vec::new()))
        };

        let acceptor = tls::build_acceptor(&config.authd.tls).expect("TLS context");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let service = Arc::new(AuthService::new(
            config.clone(),
            KeyStore::new(),
            Some(acceptor),
            password.map(str::to_string),
        ));

        let master = config
            .worker_node()
            .then(|| MasterChannel::new(config.cluster.master_socket.clone()));
        let (queue_tx, queue_rx) = mpsc::channel(config.authd.pool_size);

        let mut tasks = vec![
            tokio::spawn(accept::run(Arc::clone(&service), listener, queue_tx)),
            tokio::spawn(dispatch::run(Arc::clone(&service), queue_rx, master)),
        ];
        if !config.worker_node() {
            let db = AgentsDb::new(config.agents_db.socket.clone());
            tasks.push(tokio::spawn(writer::run(Arc::clone(&service), db)));
        }

        // Client side trusts exactly the generated certificate.
        let mut roots = RootCertStore::empty();
        roots.add(cert.cert.der().clone()).unwrap();
        let client_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );

        Self {
            addr,
            service,
            keys_file: config.authd.keys_file,
            db_commands,
            master_requests,
            client_config,
            tasks,
            dir,
        }
    }

    /// Connects over TLS, sends one enrollment record, and returns
    /// everything the daemon wrote back before closing.
    pub async fn enroll(&self, request: &str) -> String {
        let tcp = TcpStream::connect(self.addr).await.expect("connect failed");
        let connector = TlsConnector::from(Arc::clone(&self.client_config));
        let server_name = ServerName::try_from("localhost".to_string()).unwrap();
        let mut stream = connector
            .connect(server_name, tcp)
            .await
            .expect("TLS handshake failed");

        stream.write_all(request.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();

        let mut response = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => response.extend_from_slice(&chunk[..n]),
            }
        }
        String::from_utf8_lossy(&response).into_owned()
    }

    /// Polls until the key file exists with content, returning it.
    pub async fn wait_for_keys_file(&self) -> String {
        for _ in 0..50 {
            if let Ok(contents) = std::fs::read_to_string(&self.keys_file) {
                if !contents.is_empty() {
                    return contents;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("key file was never flushed");
    }

    /// Requests shutdown and joins every stage. Returns the fixture's
    /// temp directory so callers that need to inspect on-disk state after
    /// shutdown can keep it alive until they're done.
    pub async fn shutdown(self) -> TempDir {
        self.service.request_shutdown();
        for task in self.tasks {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("stage did not stop")
                .expect("stage panicked");
        }
        self.dir
    }
}

/// Extracts the raw key from a success response
/// `OSSEC K:'<id> <name> <ip> <key>'`.
pub fn key_from_response(response: &str) -> &str {
    response
        .strip_prefix("OSSEC K:'")
        .and_then(|r| r.strip_suffix('\''))
        .and_then(|r| r.split_whitespace().nth(3))
        .expect("malformed success response")
}

/// Stub agents database: answers every command line with `ok` and records
/// it.
async fn spawn_db_stub(socket: &std::path::Path) -> Arc<Mutex<Vec<String>>> {
    let listener = UnixListener::bind(socket).expect("failed to bind db stub");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_writer = Arc::clone(&seen);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let seen = Arc::clone(&seen_writer);
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    seen.lock().await.push(line);
                    if write.write_all(b"ok\n").await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    seen
}

/// Stub master channel: answers every request line with the given JSON
/// reply and records it.
async fn spawn_master_stub(
    socket: &std::path::Path,
    reply: String,
) -> Arc<Mutex<Vec<String>>> {
    let listener = UnixListener::bind(socket).expect("failed to bind master stub");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_writer = Arc::clone(&seen);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let seen = Arc::clone(&seen_writer);
            let reply = reply.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    seen.lock().await.push(line);
                    if write
                        .write_all(format!("{reply}\n").as_bytes())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }
    });
    seen
}
