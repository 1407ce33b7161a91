//! Accept stage: listening socket and connection hand-off.
//!
//! Owns the listening TCP socket. Accepted connections are wrapped in a
//! [`Client`] descriptor and pushed onto the bounded client queue; when the
//! queue is full the connection is closed immediately, bounding the number
//! of live descriptors to the configured pool size with no keystore
//! mutation. Accept waits at most one second at a time so shutdown latency
//! is bounded.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::service::SharedService;

/// Poll interval for re-checking the running flag while waiting.
const ACCEPT_WAIT: Duration = Duration::from_secs(1);

/// An accepted connection in transit to dispatch.
#[derive(Debug)]
pub struct Client {
    /// The accepted socket.
    pub stream: TcpStream,
    /// Remote address (family and bytes).
    pub addr: SocketAddr,
}

/// Runs the accept loop until shutdown.
///
/// Accept failures are logged and the loop continues; only shutdown ends
/// it. The listener is dropped (closed) on exit.
pub async fn run(service: SharedService, listener: TcpListener, queue: mpsc::Sender<Client>) {
    debug!("accept stage ready");

    while service.is_running() {
        let accepted = match tokio::time::timeout(ACCEPT_WAIT, listener.accept()).await {
            Ok(accepted) => accepted,
            Err(_) => continue, // timeout: re-check the running flag
        };

        match accepted {
            Ok((stream, addr)) => {
                match queue.try_send(Client { stream, addr }) {
                    Ok(()) => {},
                    Err(mpsc::error::TrySendError::Full(client)) => {
                        warn!(ip = %client.addr.ip(), "Too many connections. Rejecting.");
                        drop(client);
                    },
                    Err(mpsc::error::TrySendError::Closed(client)) => {
                        drop(client);
                        break;
                    },
                }
            },
            Err(e) => {
                error!(error = %e, "accept failed");
            },
        }
    }

    debug!("accept stage finished");
    drop(listener);
}
