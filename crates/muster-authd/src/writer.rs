//! Writer stage: durable keystore flush and agents-database sync.
//!
//! Single consumer of the pending-change journal. Each cycle swaps the
//! journal and a keystore snapshot out under the registry mutex, then works
//! entirely on owned data: the key file and the timestamp sidecar are
//! written atomically first, then the journal records are replayed against
//! the agents database. The ordering means that after a crash the on-disk
//! keystore is always a superset of what the database observed.
//!
//! Persistence failures are logged and the loop continues after a short
//! sleep; journal records whose database call failed are dropped rather
//! than re-queued, the key file being authoritative. Not started on worker
//! nodes.

use std::path::Path;
use std::time::Duration;

use muster_core::journal::{JournalRecord, PendingAgent};
use muster_core::keystore::KeyStore;
use muster_core::persist;
use tracing::{debug, error, warn};

use crate::agents_db::{AgentsDb, SyncLabel};
use crate::service::SharedService;

/// Pause after a failed file write before carrying on.
const WRITE_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Runs the writer loop until shutdown, draining any remaining journal
/// records before exiting.
pub async fn run(service: SharedService, mut db: AgentsDb) {
    debug!("writer stage ready");

    loop {
        service.wait_for_pending().await;

        if let Some((snapshot, records)) = service.take_pending().await {
            flush(&service, &mut db, &snapshot, records).await;
        }

        if !service.is_running() {
            // One more swap in case dispatch committed between our flush
            // and its own shutdown.
            if let Some((snapshot, records)) = service.take_pending().await {
                flush(&service, &mut db, &snapshot, records).await;
            }
            break;
        }
    }

    debug!("writer stage finished");
}

/// One flush cycle over owned data: files first, then database effects.
async fn flush(
    service: &SharedService,
    db: &mut AgentsDb,
    snapshot: &KeyStore,
    records: Vec<JournalRecord>,
) {
    debug!(records = records.len(), "dumping changes to disk");

    let config = service.config();

    if let Err(e) = persist::atomic_write(
        &config.authd.keys_file,
        snapshot.serialize().as_bytes(),
    ) {
        error!(error = %e, "couldn't write the key file");
        tokio::time::sleep(WRITE_RETRY_PAUSE).await;
    }

    if let Err(e) = persist::atomic_write(
        &config.authd.timestamps_file,
        snapshot.serialize_timestamps().as_bytes(),
    ) {
        error!(error = %e, "couldn't write the timestamp file");
        tokio::time::sleep(WRITE_RETRY_PAUSE).await;
    }

    let sync_label = if config.single_node() {
        SyncLabel::Synced
    } else {
        SyncLabel::SyncReq
    };

    let mut inserted = 0usize;
    let mut removed = 0usize;

    for record in records {
        match record {
            JournalRecord::Insert(agent) => {
                debug!(id = %agent.id, name = %agent.name, "performing insert");

                if let Err(e) = db.insert_agent(&agent).await {
                    warn!(id = %agent.id, error = %e, "agents database insert failed");
                }
                if let Some(group) = &agent.group {
                    if let Err(e) = db.assign_groups(&agent.id, group, sync_label).await {
                        error!(
                            id = %agent.id,
                            group = %group,
                            error = %e,
                            "unable to set agent centralized group"
                        );
                    }
                }
                inserted += 1;
            },
            JournalRecord::Remove(agent) => {
                debug!(id = %agent.id, name = %agent.name, "performing delete");

                remove_artifacts(&config.authd.state_dir, &agent);
                if let Err(e) = db.remove_agent(&agent.id).await {
                    warn!(id = %agent.id, error = %e, "agents database delete failed");
                }
                if let Err(e) = db.generic_remove(&agent.id).await {
                    warn!(id = %agent.id, error = %e, "generic remove query failed");
                }
                removed += 1;
            },
        }
    }

    debug!(inserted, removed, "writer cycle complete");
}

/// Deletes the per-agent state artifacts of a removed agent: the agent-info
/// file (keyed `<name>-<ip>`) and the counter state (keyed by id). Missing
/// files are not an error.
fn remove_artifacts(state_dir: &Path, agent: &PendingAgent) {
    let agent_info = state_dir
        .join("agent-info")
        .join(format!("{}-{}", agent.name, agent.ip));
    let counter = state_dir.join("rids").join(&agent.id);

    for path in [agent_info, counter] {
        match std::fs::remove_file(&path) {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => warn!(path = %path.display(), error = %e, "artifact cleanup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use muster_core::config::AuthdConfig;
    use muster_core::protocol::EnrollmentRequest;

    use super::*;
    use crate::service::{AuthService, EnrollOutcome};

    async fn enroll(service: &AuthService, name: &str, ip: &str) {
        let request = EnrollmentRequest {
            name: name.to_string(),
            group: None,
            key_hash: None,
            password: None,
        };
        match service.stage_enrollment(&request, ip).await.unwrap() {
            EnrollOutcome::Staged(staged) => service.commit_enrollment(staged).await,
            EnrollOutcome::Existing { .. } => panic!("expected a fresh enrollment"),
        }
    }

    #[tokio::test]
    async fn writer_flushes_and_drains_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AuthdConfig::default();
        config.authd.keys_file = dir.path().join("agent.keys");
        config.authd.timestamps_file = dir.path().join("agents-timestamp");
        config.authd.state_dir = dir.path().join("state");
        let db_socket = dir.path().join("agents-db.sock");
        config.agents_db.socket.clone_from(&db_socket);

        // Stub agents database: accept connections, answer every line "ok".
        let listener = tokio::net::UnixListener::bind(&db_socket).unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
                    let (read, mut write) = stream.into_split();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(_line)) = lines.next_line().await {
                        if write.write_all(b"ok\n").await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        let keys_file = config.authd.keys_file.clone();
        let service = Arc::new(AuthService::new(
            config.clone(),
            muster_core::keystore::KeyStore::new(),
            None,
            None,
        ));
        let db = AgentsDb::new(config.agents_db.socket.clone());
        let writer = tokio::spawn(run(Arc::clone(&service), db));

        enroll(&service, "web01", "203.0.113.7").await;

        // The flush lands without any shutdown prompting.
        let mut contents = String::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            contents = std::fs::read_to_string(&keys_file).unwrap_or_default();
            if !contents.is_empty() {
                break;
            }
        }
        assert!(
            contents.starts_with("001 web01 203.0.113.7 "),
            "unexpected key file contents: {contents:?}"
        );

        // A commit racing shutdown is still drained before exit.
        enroll(&service, "db01", "203.0.113.8").await;
        service.request_shutdown();
        tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .expect("writer did not stop")
            .unwrap();

        let contents = std::fs::read_to_string(&keys_file).unwrap();
        assert!(contents.contains("002 db01 203.0.113.8 "));
    }

    #[test]
    fn artifact_cleanup_ignores_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let agent = PendingAgent {
            id: "007".to_string(),
            name: "gone".to_string(),
            ip: "203.0.113.9".to_string(),
            key: "ab".repeat(32),
            group: None,
        };
        // Nothing exists yet; must not panic or error.
        remove_artifacts(dir.path(), &agent);

        let info_dir = dir.path().join("agent-info");
        std::fs::create_dir_all(&info_dir).unwrap();
        let info = info_dir.join("gone-203.0.113.9");
        std::fs::write(&info, b"x").unwrap();
        remove_artifacts(dir.path(), &agent);
        assert!(!info.exists());
    }
}
