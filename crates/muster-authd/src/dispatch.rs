//! Dispatch stage: TLS session, protocol parse, validation, key allocation.
//!
//! One long-running consumer of the client queue. Each popped client gets a
//! TLS session derived from the process-wide context, a bounded request
//! read, and either a local enrollment (master node) or a forwarded one
//! (worker node). Every failure here is per-connection: the client is
//! closed and the loop moves on.
//!
//! The happens-before contract with the writer stage: the TLS write of the
//! success response completes before the insert record is journaled, so an
//! agent that received its key appears in at most one subsequent keystore
//! flush, and a failed write leaves no trace of the request.

use std::time::Duration;

use muster_core::protocol::{
    self, ERROR_UNABLE_TO_ADD, EnrollmentRequest, MAX_REQUEST_SIZE,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tracing::{debug, error, info, warn};

use crate::accept::Client;
use crate::cluster::MasterChannel;
use crate::service::{EnrollOutcome, SharedService};
use crate::tls;

/// Deadline on the queue pop, bounding shutdown latency.
const POP_WAIT: Duration = Duration::from_secs(1);

/// Runs the dispatch loop until shutdown.
///
/// `master` is `Some` on worker nodes; it replaces the local keystore
/// mutation path entirely.
pub async fn run(
    service: SharedService,
    mut queue: mpsc::Receiver<Client>,
    master: Option<MasterChannel>,
) {
    debug!("dispatch stage ready");

    while service.is_running() {
        let client = match tokio::time::timeout(POP_WAIT, queue.recv()).await {
            Ok(Some(client)) => client,
            Ok(None) => break, // accept stage is gone
            Err(_) => continue,
        };
        handle_client(&service, master.as_ref(), client).await;
    }

    debug!("dispatch stage finished");
}

/// Handles one client from handshake to close. Never fails the stage; all
/// errors are logged and end the connection.
///
/// A shutdown signal abandons the connection at any suspension point up
/// through request parsing, handshake included, rather than waiting out
/// the I/O deadlines. Once the enrollment branch starts it runs to
/// completion: a staged entry is always committed or rolled back, never
/// dropped mid-flight with the registry mutated.
async fn handle_client(service: &SharedService, master: Option<&MasterChannel>, client: Client) {
    let ip = client.addr.ip().to_string();

    let accepted = tokio::select! {
        () = service.cancelled() => {
            debug!(%ip, "connection abandoned during shutdown");
            return;
        },
        accepted = read_request(service, client, &ip) => accepted,
    };
    let Some((mut stream, request)) = accepted else {
        return;
    };

    match master {
        Some(master) => enroll_via_master(master, &mut stream, &ip, &request).await,
        None => enroll_local(service, &mut stream, &ip, &request).await,
    }

    let _ = stream.shutdown().await;
}

/// The cancellable front half of a connection: TLS handshake, certificate
/// host check, bounded request read, parse, password gate. Nothing here
/// touches the registry, so the caller may drop this future at any await.
///
/// Failure paths answer the client best-effort and close the session;
/// `None` means the connection is finished.
async fn read_request(
    service: &SharedService,
    client: Client,
    ip: &str,
) -> Option<(TlsStream<TcpStream>, EnrollmentRequest)> {
    let acceptor = service.acceptor()?;
    let deadline = service.config().recv_timeout();

    let mut stream = match with_deadline(deadline, acceptor.accept(client.stream)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(%ip, error = %e, "TLS handshake failed");
            return None;
        },
        Err(_) => {
            debug!(%ip, "TLS handshake timed out");
            return None;
        },
    };

    info!(%ip, "new connection");

    let tls_section = &service.config().authd.tls;
    if tls_section.verify_host && tls_section.agent_ca.is_some() {
        if let Err(e) = tls::verify_peer_host(stream.get_ref().1, ip) {
            warn!(%ip, error = %e, "unable to verify client certificate");
            let _ = stream.shutdown().await;
            return None;
        }
    }

    let mut buf = vec![0u8; MAX_REQUEST_SIZE];
    let len = match with_deadline(deadline, stream.read(&mut buf)).await {
        Ok(Ok(0)) => {
            debug!(%ip, "client closed before sending a request");
            let _ = stream.shutdown().await;
            return None;
        },
        Ok(Ok(len)) => len,
        Ok(Err(e)) => {
            warn!(%ip, error = %e, "request read failed");
            let _ = stream.shutdown().await;
            return None;
        },
        Err(_) => {
            info!(%ip, "client timeout");
            let _ = stream.shutdown().await;
            return None;
        },
    };

    let Ok(record) = std::str::from_utf8(&buf[..len]) else {
        reject(&mut stream, ip, Some("Invalid request")).await;
        let _ = stream.shutdown().await;
        return None;
    };
    debug!(%ip, request = record.trim_end(), "request received");

    let request = match EnrollmentRequest::parse(record.trim_end()) {
        Ok(request) => request,
        Err(e) => {
            warn!(%ip, error = %e, "could not parse enrollment request");
            reject(&mut stream, ip, Some(&e.to_string())).await;
            let _ = stream.shutdown().await;
            return None;
        },
    };

    if !service.check_password(request.password.as_deref()) {
        warn!(%ip, agent = %request.name, "invalid enrollment password");
        reject(&mut stream, ip, Some("Invalid password")).await;
        let _ = stream.shutdown().await;
        return None;
    }

    Some((stream, request))
}

/// Master-node path: stage under the registry mutex, answer the agent, then
/// commit (journal + writer wakeup) or roll back depending on whether the
/// response actually went out.
async fn enroll_local(
    service: &SharedService,
    stream: &mut TlsStream<TcpStream>,
    ip: &str,
    request: &EnrollmentRequest,
) {
    match service.stage_enrollment(request, ip).await {
        Ok(EnrollOutcome::Existing { id, key }) => {
            let response = protocol::format_key_response(&id, &request.name, ip, &key);
            match send(stream, &response).await {
                Ok(()) => info!(agent = %request.name, %ip, %id, "existing key re-issued"),
                Err(e) => warn!(%ip, error = %e, "TLS write error"),
            }
        },
        Ok(EnrollOutcome::Staged(staged)) => {
            let response =
                protocol::format_key_response(&staged.id, &staged.name, &staged.ip, &staged.key);
            match send(stream, &response).await {
                Ok(()) => {
                    info!(agent = %staged.name, %ip, id = %staged.id, "agent key generated");
                    service.commit_enrollment(staged).await;
                },
                Err(e) => {
                    error!(%ip, error = %e, "TLS write error");
                    error!(agent = %staged.name, "agent key not saved");
                    service.rollback_enrollment(staged).await;
                },
            }
        },
        Err(e) => {
            warn!(%ip, agent = %request.name, reason = %e, "enrollment rejected");
            reject(stream, ip, Some(&e.to_string())).await;
        },
    }
}

/// Worker-node path: the master decides; a failed response write is undone
/// with a clustered remove so the master does not keep an identity the
/// agent never received.
async fn enroll_via_master(
    master: &MasterChannel,
    stream: &mut TlsStream<TcpStream>,
    ip: &str,
    request: &EnrollmentRequest,
) {
    info!(%ip, agent = %request.name, "dispatching enrollment to master node");

    match master.enroll(request, ip).await {
        Ok(grant) => {
            let response = protocol::format_key_response(&grant.id, &request.name, ip, &grant.key);
            match send(stream, &response).await {
                Ok(()) => {
                    info!(agent = %request.name, %ip, id = %grant.id, "agent key issued by master");
                },
                Err(e) => {
                    error!(%ip, error = %e, "TLS write error");
                    match master.remove(&grant.id).await {
                        Ok(()) => error!(agent = %request.name, "agent key not saved"),
                        Err(remove_err) => error!(
                            agent = %request.name,
                            error = %remove_err,
                            "agent key unshared and master-node removal failed"
                        ),
                    }
                },
            }
        },
        Err(e) => {
            warn!(%ip, error = %e, "clustered enrollment failed");
            reject(stream, ip, None).await;
        },
    }
}

/// Best-effort rejection: an optional reason line, then the generic one.
async fn reject(stream: &mut TlsStream<TcpStream>, ip: &str, reason: Option<&str>) {
    let mut message = String::new();
    if let Some(reason) = reason {
        message.push_str(&protocol::format_error(reason));
        message.push('\n');
    }
    message.push_str(ERROR_UNABLE_TO_ADD);

    if let Err(e) = send(stream, &message).await {
        debug!(%ip, error = %e, "could not deliver error response");
    }
}

async fn send(stream: &mut TlsStream<TcpStream>, response: &str) -> std::io::Result<()> {
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

/// Applies the configured receive deadline, or none when it is disabled.
async fn with_deadline<F>(
    limit: Option<Duration>,
    fut: F,
) -> Result<F::Output, tokio::time::error::Elapsed>
where
    F: std::future::Future,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await,
        None => Ok(fut.await),
    }
}
