//! Shared service state for the enrollment daemon.
//!
//! [`AuthService`] is the single value every stage holds an `Arc` of. It
//! owns the immutable TLS acceptor and enrollment password, the `running`
//! lifecycle flag, and the registry: the keystore, the pending-change
//! journal, and the `write_pending` flag, all guarded by one mutex.
//!
//! # Two-phase enrollment
//!
//! Dispatch must be able to un-do an enrollment whose success response never
//! reached the agent. Mutation is therefore split:
//!
//! 1. [`stage_enrollment`](AuthService::stage_enrollment) validates and
//!    inserts the entry under one lock acquisition, returning a
//!    [`StagedEnrollment`] handle.
//! 2. After the TLS write succeeds, [`commit_enrollment`]
//!    (AuthService::commit_enrollment) appends the journal records, sets
//!    `write_pending`, and wakes the writer.
//! 3. After a failed TLS write, [`rollback_enrollment`]
//!    (AuthService::rollback_enrollment) removes the entry again (and
//!    restores anything a forced enrollment displaced).
//!
//! Until commit, nothing is journaled, so a rollback leaves no trace.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use muster_core::config::AuthdConfig;
use muster_core::journal::{JournalRecord, PendingAgent};
use muster_core::keystore::{AgentEntry, AgentFlags, KeyStore};
use muster_core::protocol::EnrollmentRequest;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio_rustls::TlsAcceptor;

/// Shared handle to the daemon service state.
pub type SharedService = Arc<AuthService>;

/// Enrollment validation failures. The `Display` text is the reason line
/// sent back to the agent.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnrollError {
    /// A live agent already holds this name.
    #[error("Duplicate agent name: {name}")]
    DuplicateName {
        /// The colliding name.
        name: String,
    },

    /// A live agent is already bound to this source address.
    #[error("Duplicate IP: {ip}")]
    DuplicateIp {
        /// The colliding address.
        ip: String,
    },
}

/// The compound guarded by the registry mutex.
#[derive(Debug, Default)]
struct Registry {
    keystore: KeyStore,
    journal: Vec<JournalRecord>,
    write_pending: bool,
}

/// Handle to an entry inserted by [`AuthService::stage_enrollment`] but not
/// yet committed.
#[derive(Debug)]
#[must_use = "a staged enrollment must be committed or rolled back"]
pub struct StagedEnrollment {
    /// Newly allocated identifier.
    pub id: String,
    /// Agent name.
    pub name: String,
    /// Source address recorded for the agent.
    pub ip: String,
    /// Freshly minted raw key.
    pub key: String,
    /// Centralized group, if requested.
    pub group: Option<String>,
    /// Entries a forced enrollment displaced; restored on rollback,
    /// journaled as removes on commit.
    displaced: Vec<PendingAgent>,
}

/// Outcome of staging an enrollment.
#[derive(Debug)]
pub enum EnrollOutcome {
    /// A new entry was inserted and awaits commit or rollback.
    Staged(StagedEnrollment),
    /// The agent proved (via key hash) that it already holds the current
    /// key; the existing identity is returned and nothing was mutated.
    Existing {
        /// The existing identifier.
        id: String,
        /// The existing raw key.
        key: String,
    },
}

/// The daemon's shared service state.
pub struct AuthService {
    config: AuthdConfig,
    acceptor: Option<TlsAcceptor>,
    password: Option<String>,
    running: AtomicBool,
    registry: Mutex<Registry>,
    pending: Notify,
}

impl AuthService {
    /// Creates the service around a loaded keystore.
    #[must_use]
    pub fn new(
        config: AuthdConfig,
        keystore: KeyStore,
        acceptor: Option<TlsAcceptor>,
        password: Option<String>,
    ) -> Self {
        Self {
            config,
            acceptor,
            password,
            running: AtomicBool::new(true),
            registry: Mutex::new(Registry {
                keystore,
                journal: Vec::new(),
                write_pending: false,
            }),
            pending: Notify::new(),
        }
    }

    /// The daemon configuration.
    #[must_use]
    pub const fn config(&self) -> &AuthdConfig {
        &self.config
    }

    /// The process-wide TLS acceptor, when remote enrollment is enabled.
    #[must_use]
    pub const fn acceptor(&self) -> Option<&TlsAcceptor> {
        self.acceptor.as_ref()
    }

    /// Whether the daemon is still running. Every stage's loop re-checks
    /// this at each suspension point.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Requests cooperative shutdown and wakes the writer so it can drain.
    pub fn request_shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.pending.notify_one();
    }

    /// Wakes the writer stage. Called once more at shutdown after the
    /// dispatch stage has been joined.
    pub fn notify_writer(&self) {
        self.pending.notify_one();
    }

    /// Resolves once shutdown has been requested, polling the running flag
    /// every 100 ms. Used to abandon in-flight connections promptly instead
    /// of waiting out their I/O deadlines.
    pub async fn cancelled(&self) {
        while self.is_running() {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }

    /// Compares the provided enrollment password against the configured one
    /// in constant time. Always true when no password is required.
    #[must_use]
    pub fn check_password(&self, provided: Option<&str>) -> bool {
        match (&self.password, provided) {
            (None, _) => true,
            (Some(expected), Some(provided)) => {
                bool::from(expected.as_bytes().ct_eq(provided.as_bytes()))
            },
            (Some(_), None) => false,
        }
    }

    /// Validates a request and inserts a new keystore entry under one lock
    /// acquisition.
    ///
    /// Policy, in order:
    /// - A name collision where the presented key hash matches the stored
    ///   key is an idempotent re-enrollment: the existing identity is
    ///   returned unchanged.
    /// - Any other name or source-address collision is rejected, unless the
    ///   force policy is enabled, in which case the colliding entry is
    ///   displaced (revoked and hidden, journaled as a remove on commit).
    ///
    /// # Errors
    ///
    /// Returns [`EnrollError`] when a collision is rejected.
    pub async fn stage_enrollment(
        &self,
        request: &EnrollmentRequest,
        ip: &str,
    ) -> Result<EnrollOutcome, EnrollError> {
        let mut registry = self.registry.lock().await;
        let mut displaced = Vec::new();

        if let Some(existing) = registry.keystore.find_by_name(&request.name) {
            if request.key_hash.as_deref() == Some(existing.key_digest().as_str()) {
                return Ok(EnrollOutcome::Existing {
                    id: existing.id.clone(),
                    key: existing.key.clone(),
                });
            }
            if !self.config.authd.force.enabled {
                return Err(EnrollError::DuplicateName {
                    name: request.name.clone(),
                });
            }
            let id = existing.id.clone();
            if let Some(entry) = registry.keystore.displace(&id) {
                displaced.push(PendingAgent::from(&entry));
            }
        }

        if let Some(existing) = registry.keystore.find_by_ip(ip) {
            if !self.config.authd.force.enabled {
                // Roll the name displacement back before rejecting.
                for agent in &displaced {
                    registry.keystore.restore(&agent.id);
                }
                return Err(EnrollError::DuplicateIp { ip: ip.to_string() });
            }
            let id = existing.id.clone();
            if let Some(entry) = registry.keystore.displace(&id) {
                displaced.push(PendingAgent::from(&entry));
            }
        }

        let id = registry.keystore.next_id();
        let key = KeyStore::generate_key();
        registry.keystore.insert(AgentEntry {
            id: id.clone(),
            name: request.name.clone(),
            ip: ip.to_string(),
            key: key.clone(),
            group: request.group.clone(),
            registered_at: Utc::now(),
            flags: AgentFlags::default(),
        });

        Ok(EnrollOutcome::Staged(StagedEnrollment {
            id,
            name: request.name.clone(),
            ip: ip.to_string(),
            key,
            group: request.group.clone(),
            displaced,
        }))
    }

    /// Commits a staged enrollment: journals the displacements and the
    /// insert in causal order, sets `write_pending`, and wakes the writer.
    pub async fn commit_enrollment(&self, staged: StagedEnrollment) {
        {
            let mut registry = self.registry.lock().await;
            for agent in staged.displaced {
                registry.journal.push(JournalRecord::Remove(agent));
            }
            registry.journal.push(JournalRecord::Insert(PendingAgent {
                id: staged.id,
                name: staged.name,
                ip: staged.ip,
                key: staged.key,
                group: staged.group,
            }));
            registry.write_pending = true;
        }
        self.pending.notify_one();
    }

    /// Rolls a staged enrollment back: the entry is removed outright and
    /// displaced entries are restored. Nothing was journaled, so no
    /// downstream effect can have been observed.
    pub async fn rollback_enrollment(&self, staged: StagedEnrollment) {
        let mut registry = self.registry.lock().await;
        registry.keystore.remove(&staged.id);
        for agent in staged.displaced {
            registry.keystore.restore(&agent.id);
        }
    }

    /// The writer's swap critical section: takes ownership of the journal,
    /// snapshots the keystore, and clears `write_pending`. Returns `None`
    /// when there is nothing to flush.
    pub async fn take_pending(&self) -> Option<(KeyStore, Vec<JournalRecord>)> {
        let mut registry = self.registry.lock().await;
        if !registry.write_pending && registry.journal.is_empty() {
            return None;
        }
        registry.write_pending = false;
        let records = std::mem::take(&mut registry.journal);
        Some((registry.keystore.clone(), records))
    }

    /// Blocks until `write_pending` is set or shutdown is requested. The
    /// mutex is held exactly long enough to check the predicate.
    pub async fn wait_for_pending(&self) {
        loop {
            let notified = self.pending.notified();
            {
                let registry = self.registry.lock().await;
                if registry.write_pending || !self.is_running() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Clones the current keystore. Test and introspection helper.
    pub async fn keystore_snapshot(&self) -> KeyStore {
        self.registry.lock().await.keystore.clone()
    }
}
