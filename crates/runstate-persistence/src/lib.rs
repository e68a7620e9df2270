//! Append-only JSON-lines state store.
//!
//! Every accepted record is one line in a single log file. The log is read
//! once on open into a per-run index; appends are written and synced before
//! they become visible in the index.
//!
//! A final line without a trailing newline is a torn write from a crash and is
//! cut off on open. Any other unreadable line fails the open. A failed append
//! is cut back off the file before the error is returned.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use runstate::{LedgerSnapshot, NewStateRecord, StateRecord, StateStore, StorageError};
use smallvec::SmallVec;
use tokio::sync::Mutex;
use tracing::{info, warn};

type Ledger = SmallVec<[StateRecord; 8]>;

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("failed to open state log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unreadable record at {path}:{line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

struct Inner {
    file: File,
    ledgers: HashMap<String, Ledger>,
    #[cfg(test)]
    fail_next_sync: bool,
}

impl Inner {
    fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.file.write_all(line)?;
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_sync) {
            return Err(std::io::Error::other("injected sync failure"));
        }
        self.file.sync_data()
    }
}

pub struct FileStateStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl FileStateStore {
    /// Open or create the log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, OpenError> {
        let path = path.as_ref().to_path_buf();
        let io = |source| OpenError::Io {
            path: path.clone(),
            source,
        };

        let mut ledgers: HashMap<String, Ledger> = HashMap::new();
        let mut good_len = 0u64;
        let mut torn = false;
        let mut unterminated = false;

        if path.exists() {
            let bytes = std::fs::read(&path).map_err(io)?;
            let mut offset = 0usize;
            for (index, line) in bytes.split(|b| *b == b'\n').enumerate() {
                let end = offset + line.len();
                let terminated = end < bytes.len();
                offset = end + 1;

                if line.iter().all(u8::is_ascii_whitespace) {
                    if terminated {
                        good_len = offset as u64;
                    } else if !line.is_empty() {
                        torn = true;
                    }
                    continue;
                }
                match serde_json::from_slice::<StateRecord>(line) {
                    Ok(record) => {
                        ledgers
                            .entry(record.identity.portal_run_id.clone())
                            .or_default()
                            .push(record);
                        good_len = if terminated { offset } else { end } as u64;
                        unterminated = !terminated;
                    }
                    Err(_) if !terminated => torn = true,
                    Err(source) => {
                        return Err(OpenError::Corrupt {
                            path: path.clone(),
                            line: index + 1,
                            source,
                        })
                    }
                }
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io)?;

        if torn {
            let on_disk = file.metadata().map_err(io)?.len();
            warn!(
                path = %path.display(),
                dropped_bytes = on_disk.saturating_sub(good_len),
                "truncating torn write at end of state log"
            );
            file.set_len(good_len).map_err(io)?;
        } else if unterminated {
            // Last record is complete but unterminated.
            file.write_all(b"\n").map_err(io)?;
        }

        info!(
            path = %path.display(),
            runs = ledgers.len(),
            records = ledgers.values().map(|l| l.len()).sum::<usize>(),
            "state log opened"
        );

        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                file,
                ledgers,
                #[cfg(test)]
                fail_next_sync: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record_count(&self, portal_run_id: &str) -> usize {
        self.inner
            .lock()
            .await
            .ledgers
            .get(portal_run_id)
            .map_or(0, |l| l.len())
    }

    pub async fn run_count(&self) -> usize {
        self.inner.lock().await.ledgers.len()
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn snapshot(&self, portal_run_id: &str) -> Result<LedgerSnapshot, StorageError> {
        let inner = self.inner.lock().await;
        let records = inner
            .ledgers
            .get(portal_run_id)
            .map(|l| l.to_vec())
            .unwrap_or_default();
        Ok(LedgerSnapshot::from_records(portal_run_id, records))
    }

    async fn append(
        &self,
        record: NewStateRecord,
        expected_version: u64,
    ) -> Result<StateRecord, StorageError> {
        let mut inner = self.inner.lock().await;
        let portal_run_id = record.identity.portal_run_id.clone();

        let version = inner
            .ledgers
            .get(&portal_run_id)
            .and_then(|l| l.iter().map(|r| r.seq).max())
            .unwrap_or(0);
        if version != expected_version {
            return Err(StorageError::Conflict {
                portal_run_id,
                expected_version,
            });
        }

        let stored = record.into_record(expected_version + 1, Utc::now());
        let mut line =
            serde_json::to_vec(&stored).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        line.push(b'\n');

        let unavailable = |e: std::io::Error| {
            StorageError::Unavailable(format!("{}: {e}", self.path.display()))
        };
        let start = inner.file.metadata().map_err(unavailable)?.len();
        if let Err(err) = inner.write_line(&line) {
            // Cut back to the last complete record so a retry cannot leave a
            // second copy or a partial line behind.
            if let Err(rollback) = inner.file.set_len(start) {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    rollback_error = %rollback,
                    "failed to roll back partial append"
                );
                return Err(StorageError::Corrupt(format!(
                    "{}: append failed ({err}) and was not rolled back ({rollback})",
                    self.path.display()
                )));
            }
            return Err(unavailable(err));
        }

        inner
            .ledgers
            .entry(portal_run_id)
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use runstate::{RunIdentity, StateChange, Status};
    use std::sync::Arc;

    fn change(portal_run_id: &str, status: Status, minute: u32) -> NewStateRecord {
        NewStateRecord::from(
            StateChange::new(
                RunIdentity::new(portal_run_id, "wgts-qc", "4.2.4"),
                status,
                Utc.with_ymd_and_hms(2025, 5, 1, 9, minute, 0).unwrap(),
            )
            .with_payload("2024.07.01", serde_json::json!({"libraryId": "L2500001"})),
        )
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.jsonl");

        {
            let store = FileStateStore::open(&path).unwrap();
            store.append(change("PR1", Status::Draft, 0), 0).await.unwrap();
            store.append(change("PR1", Status::Ready, 1), 1).await.unwrap();
            store.append(change("PR2", Status::Draft, 0), 0).await.unwrap();
        }

        let store = FileStateStore::open(&path).unwrap();
        assert_eq!(store.run_count().await, 2);
        let snap = store.snapshot("PR1").await.unwrap();
        assert_eq!(snap.version, 2);
        assert_eq!(snap.records[1].status, Status::Ready);
        assert_eq!(
            snap.records[0].payload.as_ref().unwrap().data["libraryId"],
            "L2500001"
        );
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::open(dir.path().join("state.jsonl")).unwrap();
        store.append(change("PR1", Status::Draft, 0), 0).await.unwrap();

        let err = store
            .append(change("PR1", Status::Ready, 1), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { expected_version: 0, .. }));
        assert_eq!(store.record_count("PR1").await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_of_many_racing_appends_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStateStore::open(dir.path().join("state.jsonl")).unwrap());

        let mut handles = Vec::new();
        for minute in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.append(change("PR1", Status::Running, minute), 0).await
            }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(store.record_count("PR1").await, 1);
    }

    #[tokio::test]
    async fn torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.jsonl");
        {
            let store = FileStateStore::open(&path).unwrap();
            store.append(change("PR1", Status::Draft, 0), 0).await.unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(br#"{"id":"half-writ"#).unwrap();
        }

        let store = FileStateStore::open(&path).unwrap();
        assert_eq!(store.record_count("PR1").await, 1);
        store.append(change("PR1", Status::Ready, 1), 1).await.unwrap();

        let reopened = FileStateStore::open(&path).unwrap();
        assert_eq!(reopened.record_count("PR1").await, 2);
    }

    #[tokio::test]
    async fn unreadable_terminated_last_line_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.jsonl");
        {
            let store = FileStateStore::open(&path).unwrap();
            store.append(change("PR1", Status::Draft, 0), 0).await.unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"{\"not\":\"a record\"}\n").unwrap();
        }
        let size = std::fs::metadata(&path).unwrap().len();

        assert!(matches!(
            FileStateStore::open(&path),
            Err(OpenError::Corrupt { line: 2, .. })
        ));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);
    }

    #[tokio::test]
    async fn failed_sync_is_rolled_back_and_retry_writes_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.jsonl");
        let store = FileStateStore::open(&path).unwrap();
        store.append(change("PR1", Status::Draft, 0), 0).await.unwrap();
        let size = std::fs::metadata(&path).unwrap().len();

        store.inner.lock().await.fail_next_sync = true;
        let ready = change("PR1", Status::Ready, 1);
        let err = store.append(ready.clone(), 1).await.unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);
        assert_eq!(store.record_count("PR1").await, 1);

        let stored = store.append(ready, 1).await.unwrap();
        assert_eq!(stored.seq, 2);
        drop(store);

        let reopened = FileStateStore::open(&path).unwrap();
        let snap = reopened.snapshot("PR1").await.unwrap();
        assert_eq!(snap.records.len(), 2);
        assert_eq!(snap.records[1].status, Status::Ready);
    }

    #[tokio::test]
    async fn unterminated_last_record_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.jsonl");
        {
            let store = FileStateStore::open(&path).unwrap();
            store.append(change("PR1", Status::Draft, 0), 0).await.unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, contents.trim_end()).unwrap();

        let store = FileStateStore::open(&path).unwrap();
        store.append(change("PR1", Status::Ready, 1), 1).await.unwrap();
        drop(store);

        let reopened = FileStateStore::open(&path).unwrap();
        assert_eq!(reopened.record_count("PR1").await, 2);
    }

    #[tokio::test]
    async fn corrupt_middle_line_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.jsonl");
        {
            let store = FileStateStore::open(&path).unwrap();
            store.append(change("PR1", Status::Draft, 0), 0).await.unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, format!("not json\n{contents}")).unwrap();

        assert!(matches!(
            FileStateStore::open(&path),
            Err(OpenError::Corrupt { line: 1, .. })
        ));
    }
}
