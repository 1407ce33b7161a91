//! Enrollment forwarding for cluster worker nodes.
//!
//! A worker node never mutates its local keystore. Dispatch hands the
//! parsed enrollment to the master node over a local channel and relays
//! the identity the master minted. The channel is request-response: one
//! JSON line out, one JSON line back, a fresh connection per call.
//!
//! Force-registration settings are deliberately not forwarded; the master
//! applies its own policy.

use std::path::PathBuf;

use muster_core::protocol::EnrollmentRequest;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::UnixStream;

/// Errors from the clustered enrollment channel.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Could not reach the master node channel.
    #[error("failed to connect to master channel at {path}: {source}")]
    Connect {
        /// The socket path.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Transport failure mid-call.
    #[error("master channel I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// The reply was not valid JSON or missed required fields.
    #[error("malformed master reply: {0}")]
    Malformed(String),

    /// The master refused the request.
    #[error("master rejected the request: {0}")]
    Rejected(String),
}

/// One request to the master node.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum MasterRequest<'a> {
    Enroll {
        name: &'a str,
        ip: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        group: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        key_hash: Option<&'a str>,
    },
    Remove {
        id: &'a str,
    },
}

/// The master's reply.
#[derive(Debug, Deserialize)]
struct MasterReply {
    ok: bool,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// The identity a master grants a forwarded enrollment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterGrant {
    /// Identifier assigned by the master.
    pub id: String,
    /// Raw key minted by the master.
    pub key: String,
}

/// Synchronous call channel to the master node.
#[derive(Debug, Clone)]
pub struct MasterChannel {
    socket_path: PathBuf,
}

impl MasterChannel {
    /// Creates a channel over the given local socket.
    #[must_use]
    pub const fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Forwards an enrollment; on success the master returns the assigned
    /// id and key.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] on transport failure or master rejection.
    pub async fn enroll(
        &self,
        request: &EnrollmentRequest,
        ip: &str,
    ) -> Result<MasterGrant, ClusterError> {
        let reply = self
            .call(&MasterRequest::Enroll {
                name: &request.name,
                ip,
                group: request.group.as_deref(),
                key_hash: request.key_hash.as_deref(),
            })
            .await?;

        match (reply.id, reply.key) {
            (Some(id), Some(key)) => Ok(MasterGrant { id, key }),
            _ => Err(ClusterError::Malformed(
                "enroll reply missing id or key".to_string(),
            )),
        }
    }

    /// Asks the master to delete an identity whose key never reached the
    /// agent.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] on transport failure or master rejection.
    pub async fn remove(&self, id: &str) -> Result<(), ClusterError> {
        self.call(&MasterRequest::Remove { id }).await.map(|_| ())
    }

    async fn call(&self, request: &MasterRequest<'_>) -> Result<MasterReply, ClusterError> {
        let stream =
            UnixStream::connect(&self.socket_path)
                .await
                .map_err(|e| ClusterError::Connect {
                    path: self.socket_path.display().to_string(),
                    source: e,
                })?;
        let mut conn = BufStream::new(stream);

        let mut line = serde_json::to_string(request)
            .map_err(|e| ClusterError::Malformed(e.to_string()))?;
        line.push('\n');
        conn.write_all(line.as_bytes()).await.map_err(ClusterError::Io)?;
        conn.flush().await.map_err(ClusterError::Io)?;

        let mut reply = String::new();
        let read = conn.read_line(&mut reply).await.map_err(ClusterError::Io)?;
        if read == 0 {
            return Err(ClusterError::Malformed(
                "master closed the channel without replying".to_string(),
            ));
        }

        let reply: MasterReply =
            serde_json::from_str(reply.trim_end()).map_err(|e| ClusterError::Malformed(e.to_string()))?;
        if reply.ok {
            Ok(reply)
        } else {
            Err(ClusterError::Rejected(
                reply.error.unwrap_or_else(|| "unspecified error".to_string()),
            ))
        }
    }
}
