//! Authoritative registry of enrolled agents.
//!
//! The keystore is the in-memory source of truth for agent identities. It is
//! loaded once at startup, mutated only under the daemon's registry mutex,
//! and snapshot-cloned by the writer stage before every flush so that disk
//! serialization never happens while the lock is held.
//!
//! # Key file format
//!
//! Line-oriented, one agent per line, four whitespace-separated fields:
//!
//! ```text
//! <id> <name> <ip> <rawkey>
//! ```
//!
//! Revoked entries keep their line with the name prefixed by `!` so that a
//! reload preserves revocation; entries flagged hidden are omitted entirely.
//! Blank lines and lines starting with `#` are skipped on load.
//!
//! # Invariants
//!
//! - Identifier and name are unique across non-revoked entries.
//! - Identifiers are numeric, allocated as max(existing) + 1, and rendered
//!   zero-padded to at least three digits.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// IP token accepted from any source address.
pub const ANY_IP: &str = "any";

/// Errors from keystore load and parse operations.
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// I/O error reading a keystore file.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path of the file being read.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A key file line did not have the four expected fields.
    #[error("malformed key file line {line}: expected '<id> <name> <ip> <key>'")]
    MalformedLine {
        /// 1-based line number.
        line: usize,
    },

    /// Two non-revoked entries share an identifier.
    #[error("duplicate agent id '{id}' in key file")]
    DuplicateId {
        /// The colliding identifier.
        id: String,
    },
}

/// Lifecycle flags on an agent entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentFlags {
    /// The entry has been administratively revoked. Revoked entries stay in
    /// the key file (marked with `!`) but no longer count for uniqueness.
    pub revoked: bool,
    /// The entry is excluded from serialization entirely. Set together with
    /// `revoked` when a forced re-enrollment displaces an agent.
    pub hidden: bool,
}

/// One enrolled agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEntry {
    /// Stable identifier, numeric in practice, unique among live entries.
    pub id: String,
    /// Display name, unique among live entries.
    pub name: String,
    /// Source IP literal, or [`ANY_IP`].
    pub ip: String,
    /// Raw shared secret (hex).
    pub key: String,
    /// Optional centralized group label.
    pub group: Option<String>,
    /// When the agent enrolled.
    pub registered_at: DateTime<Utc>,
    /// Lifecycle flags.
    pub flags: AgentFlags,
}

impl AgentEntry {
    /// SHA-256 digest of the raw key, hex-encoded.
    ///
    /// This is what an agent presents in the `K:` token when it re-enrolls
    /// to prove it already holds the current key.
    #[must_use]
    pub fn key_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.key.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Whether this entry participates in uniqueness checks.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        !self.flags.revoked && !self.flags.hidden
    }
}

/// In-memory authoritative set of agent entries.
#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    entries: Vec<AgentEntry>,
}

impl KeyStore {
    /// Creates an empty keystore.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Loads a keystore from the canonical key file.
    ///
    /// A missing file yields an empty keystore; the daemon creates the file
    /// on first flush.
    ///
    /// # Errors
    ///
    /// Returns [`KeystoreError`] on I/O failure, a malformed line, or a
    /// duplicate live identifier.
    pub fn load(path: &Path) -> Result<Self, KeystoreError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => {
                return Err(KeystoreError::Io {
                    path: path.display().to_string(),
                    source: e,
                })
            },
        };

        let mut store = Self::new();
        let mut seen = HashSet::new();

        for (idx, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let (Some(id), Some(name), Some(ip), Some(key)) = (
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
            ) else {
                return Err(KeystoreError::MalformedLine { line: idx + 1 });
            };

            let (name, revoked) = match name.strip_prefix('!') {
                Some(stripped) => (stripped, true),
                None => (name, false),
            };

            let entry = AgentEntry {
                id: id.to_string(),
                name: name.to_string(),
                ip: ip.to_string(),
                key: key.to_string(),
                group: None,
                registered_at: Utc::now(),
                flags: AgentFlags {
                    revoked,
                    hidden: false,
                },
            };

            if entry.is_live() && !seen.insert(entry.id.clone()) {
                return Err(KeystoreError::DuplicateId { id: entry.id });
            }

            store.entries.push(entry);
        }

        Ok(store)
    }

    /// Renders the canonical key file contents.
    ///
    /// The writer stage passes the result to
    /// [`persist::atomic_write`](crate::persist::atomic_write); this function
    /// itself performs no I/O.
    #[must_use]
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            if entry.flags.hidden {
                continue;
            }
            let bang = if entry.flags.revoked { "!" } else { "" };
            let _ = writeln!(out, "{} {bang}{} {} {}", entry.id, entry.name, entry.ip, entry.key);
        }
        out
    }

    /// Loads registration timestamps from the sidecar file, matching entries
    /// by identifier. Unknown ids and unparsable lines are ignored; the
    /// sidecar is advisory.
    ///
    /// # Errors
    ///
    /// Returns [`KeystoreError::Io`] only on a read failure other than the
    /// file being absent.
    pub fn load_timestamps(&mut self, path: &Path) -> Result<(), KeystoreError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(KeystoreError::Io {
                    path: path.display().to_string(),
                    source: e,
                })
            },
        };

        let mut stamps = HashMap::new();
        for line in contents.lines() {
            let mut fields = line.split_whitespace();
            let (Some(id), Some(_name), Some(_ip), Some(stamp)) = (
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
            ) else {
                continue;
            };
            if let Ok(parsed) = DateTime::parse_from_rfc3339(stamp) {
                stamps.insert(id.to_string(), parsed.with_timezone(&Utc));
            }
        }

        for entry in &mut self.entries {
            if let Some(stamp) = stamps.get(&entry.id) {
                entry.registered_at = *stamp;
            }
        }

        Ok(())
    }

    /// Renders the timestamp sidecar contents: `<id> <name> <ip> <rfc3339>`
    /// per live or revoked entry.
    #[must_use]
    pub fn serialize_timestamps(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            if entry.flags.hidden {
                continue;
            }
            let _ = writeln!(
                out,
                "{} {} {} {}",
                entry.id,
                entry.name,
                entry.ip,
                entry.registered_at.to_rfc3339_opts(SecondsFormat::Secs, true)
            );
        }
        out
    }

    /// Allocates the next agent identifier: numeric max over all entries
    /// (revoked included, so ids are never reused) plus one, zero-padded to
    /// three digits.
    #[must_use]
    pub fn next_id(&self) -> String {
        let max = self
            .entries
            .iter()
            .filter_map(|e| e.id.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        format!("{:03}", max + 1)
    }

    /// Generates a fresh raw agent key: 32 random bytes, hex-encoded.
    #[must_use]
    pub fn generate_key() -> String {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Looks up the live entry with the given name.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<&AgentEntry> {
        self.entries
            .iter()
            .find(|e| e.is_live() && e.name == name)
    }

    /// Looks up the live entry bound to the given source IP. Entries with
    /// the [`ANY_IP`] wildcard never match here; they do not reserve an
    /// address.
    #[must_use]
    pub fn find_by_ip(&self, ip: &str) -> Option<&AgentEntry> {
        if ip == ANY_IP {
            return None;
        }
        self.entries.iter().find(|e| e.is_live() && e.ip == ip)
    }

    /// Looks up any entry (live or not) by identifier.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&AgentEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Appends a new entry. The caller is responsible for uniqueness; this
    /// is enforced by the service's staging critical section, not here.
    pub fn insert(&mut self, entry: AgentEntry) {
        self.entries.push(entry);
    }

    /// Removes the entry with the given identifier outright, returning it.
    /// Used to roll back a staged enrollment whose response never reached
    /// the agent.
    pub fn remove(&mut self, id: &str) -> Option<AgentEntry> {
        let idx = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(idx))
    }

    /// Marks the entry with the given identifier revoked and hidden, so it
    /// drops out of uniqueness checks and out of the key file on the next
    /// flush. Returns the entry's field copy for the remove journal.
    pub fn displace(&mut self, id: &str) -> Option<AgentEntry> {
        let entry = self.entries.iter_mut().find(|e| e.id == id)?;
        entry.flags.revoked = true;
        entry.flags.hidden = true;
        Some(entry.clone())
    }

    /// Clears the revoked and hidden flags on an entry, undoing
    /// [`displace`](Self::displace). Used when the enrollment that displaced
    /// the entry is rolled back before anything was flushed.
    pub fn restore(&mut self, id: &str) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.flags = AgentFlags::default();
                true
            },
            None => false,
        }
    }

    /// Number of entries, including revoked and hidden ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the keystore holds no entries at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over all entries.
    pub fn iter(&self) -> impl Iterator<Item = &AgentEntry> {
        self.entries.iter()
    }
}
