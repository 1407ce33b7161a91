//! Pending-change journal between enrollment and the next flush.
//!
//! Every keystore mutation that must reach disk and the agents database is
//! recorded as a [`JournalRecord`] appended under the registry mutex. The
//! writer stage takes the whole sequence in one swap (`std::mem::take`) and
//! applies it in order, so the order in which dispatch appends records is
//! exactly the order in which the writer consumes them.
//!
//! Inserts and removes share one tagged sequence rather than two separate
//! lists; a forced re-enrollment that displaces an agent and registers its
//! replacement therefore keeps its causal order all the way to the agents
//! database.

use crate::keystore::AgentEntry;

/// Field copy carried by a journal record: everything the writer needs to
/// synchronize one agent without touching the keystore again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAgent {
    /// Agent identifier.
    pub id: String,
    /// Agent display name.
    pub name: String,
    /// Source IP literal or wildcard.
    pub ip: String,
    /// Raw shared secret.
    pub key: String,
    /// Centralized group label, if any.
    pub group: Option<String>,
}

impl From<&AgentEntry> for PendingAgent {
    fn from(entry: &AgentEntry) -> Self {
        Self {
            id: entry.id.clone(),
            name: entry.name.clone(),
            ip: entry.ip.clone(),
            key: entry.key.clone(),
            group: entry.group.clone(),
        }
    }
}

/// One pending change, tagged by direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    /// The agent was enrolled and must be inserted downstream.
    Insert(PendingAgent),
    /// The agent was displaced or removed and must be cleaned up downstream.
    Remove(PendingAgent),
}

impl JournalRecord {
    /// The agent fields this record carries, regardless of direction.
    #[must_use]
    pub const fn agent(&self) -> &PendingAgent {
        match self {
            Self::Insert(agent) | Self::Remove(agent) => agent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(id: &str) -> PendingAgent {
        PendingAgent {
            id: id.to_string(),
            name: format!("agent-{id}"),
            ip: "any".to_string(),
            key: "00".repeat(32),
            group: None,
        }
    }

    #[test]
    fn take_preserves_append_order() {
        let mut journal = vec![
            JournalRecord::Remove(pending("001")),
            JournalRecord::Insert(pending("002")),
            JournalRecord::Insert(pending("003")),
        ];

        let drained = std::mem::take(&mut journal);
        assert!(journal.is_empty());

        let ids: Vec<&str> = drained.iter().map(|r| r.agent().id.as_str()).collect();
        assert_eq!(ids, ["001", "002", "003"]);
        assert!(matches!(drained[0], JournalRecord::Remove(_)));
        assert!(matches!(drained[1], JournalRecord::Insert(_)));
    }
}
