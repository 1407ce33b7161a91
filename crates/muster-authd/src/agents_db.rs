//! Agents database client.
//!
//! The agents database is a separate durable store keyed by agent id; the
//! writer stage keeps it in lockstep with the keystore file. The transport
//! is a local stream socket speaking newline-terminated ASCII commands with
//! a status-prefixed response line:
//!
//! ```text
//! → insert-agent 001 web01 203.0.113.7 <rawkey>
//! ← ok
//! → set-agent-groups 001 override syncreq dmz
//! ← ok
//! → remove-agent 001
//! ← err agent not found
//! ```
//!
//! The writer owns the single connection handle; it is never shared. The
//! connection is established lazily and dropped on any transport error so
//! the next command reconnects.

use std::path::PathBuf;

use muster_core::journal::PendingAgent;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::UnixStream;
use tracing::debug;

/// Group assignment mode. Enrollment always overrides whatever groups a
/// re-registered agent had before.
const GROUP_MODE: &str = "override";

/// Sync label attached to a group assignment, chosen by cluster topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncLabel {
    /// Single-node deployment: the assignment is already in sync.
    Synced,
    /// Clustered deployment: the assignment still has to propagate.
    SyncReq,
}

impl SyncLabel {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::SyncReq => "syncreq",
        }
    }
}

/// Errors from agents database operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// Could not connect to the database socket.
    #[error("failed to connect to agents database at {path}: {source}")]
    Connect {
        /// The socket path.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Transport failure mid-command.
    #[error("agents database I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// The database closed the connection without answering.
    #[error("agents database closed the connection")]
    Closed,

    /// The database answered with an error status.
    #[error("agents database rejected '{command}': {message}")]
    Rejected {
        /// The command verb that was rejected.
        command: String,
        /// The database's error message.
        message: String,
    },
}

/// Client handle for the agents database.
pub struct AgentsDb {
    socket_path: PathBuf,
    conn: Option<BufStream<UnixStream>>,
}

impl AgentsDb {
    /// Creates a client for the given socket path. No connection is made
    /// until the first command.
    #[must_use]
    pub const fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            conn: None,
        }
    }

    /// Inserts an enrolled agent.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on transport failure or database rejection.
    pub async fn insert_agent(&mut self, agent: &PendingAgent) -> Result<(), DbError> {
        let command = format!(
            "insert-agent {} {} {} {}",
            agent.id, agent.name, agent.ip, agent.key
        );
        self.command("insert-agent", &command).await
    }

    /// Assigns an agent's centralized group.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on transport failure or database rejection.
    pub async fn assign_groups(
        &mut self,
        id: &str,
        group: &str,
        sync: SyncLabel,
    ) -> Result<(), DbError> {
        let command = format!("set-agent-groups {id} {GROUP_MODE} {} {group}", sync.as_str());
        self.command("set-agent-groups", &command).await
    }

    /// Deletes an agent row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on transport failure or database rejection.
    pub async fn remove_agent(&mut self, id: &str) -> Result<(), DbError> {
        self.command("remove-agent", &format!("remove-agent {id}"))
            .await
    }

    /// Issues the generic administrative remove for whatever auxiliary
    /// state the database keeps per agent.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on transport failure or database rejection.
    pub async fn generic_remove(&mut self, id: &str) -> Result<(), DbError> {
        self.command("remove", &format!("remove {id}")).await
    }

    /// Sends one command line and reads the status response. Any transport
    /// error drops the connection so the next command starts fresh.
    async fn command(&mut self, verb: &str, line: &str) -> Result<(), DbError> {
        if self.conn.is_none() {
            let stream =
                UnixStream::connect(&self.socket_path)
                    .await
                    .map_err(|e| DbError::Connect {
                        path: self.socket_path.display().to_string(),
                        source: e,
                    })?;
            debug!(path = %self.socket_path.display(), "connected to agents database");
            self.conn = Some(BufStream::new(stream));
        }
        let conn = self.conn.as_mut().ok_or(DbError::Closed)?;

        let result = Self::exchange(conn, line).await;
        if matches!(result, Err(DbError::Io(_) | DbError::Closed)) {
            self.conn = None;
        }

        match result? {
            response if response == "ok" || response.starts_with("ok ") => Ok(()),
            response => Err(DbError::Rejected {
                command: verb.to_string(),
                message: response
                    .strip_prefix("err ")
                    .unwrap_or(&response)
                    .to_string(),
            }),
        }
    }

    async fn exchange(conn: &mut BufStream<UnixStream>, line: &str) -> Result<String, DbError> {
        conn.write_all(line.as_bytes()).await.map_err(DbError::Io)?;
        conn.write_all(b"\n").await.map_err(DbError::Io)?;
        conn.flush().await.map_err(DbError::Io)?;

        let mut response = String::new();
        let read = conn.read_line(&mut response).await.map_err(DbError::Io)?;
        if read == 0 {
            return Err(DbError::Closed);
        }
        Ok(response.trim_end().to_string())
    }
}
