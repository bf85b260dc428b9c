use crate::types::{ExecutionId, ExecutionRecord, ExecutionStatus};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

const EXECUTIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("executions");
// execution id -> wake-up time in unix millis
const WAKEUPS_TABLE: TableDefinition<&str, i64> = TableDefinition::new("wakeups");

/// Durable store of execution records
pub trait ExecutionStore: Send + Sync {
    /// Insert or replace a record
    fn save(&self, record: &ExecutionRecord) -> Result<()>;

    /// Get a record by ID
    fn get(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>>;

    /// List all records, most recently started first
    fn list(&self) -> Result<Vec<ExecutionRecord>>;

    /// IDs of suspended executions whose wake-up time is at or before `now`
    fn due_wakeups(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionId>>;
}

fn pending_wakeup(record: &ExecutionRecord) -> Option<i64> {
    match record.status {
        ExecutionStatus::Running => record.wake_at.map(|t| t.timestamp_millis()),
        _ => None,
    }
}

/// Execution store backed by redb
#[derive(Clone)]
pub struct RedbExecutionStore {
    db: Arc<Database>,
}

impl RedbExecutionStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create state directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _executions = write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("Failed to open executions table")?;
            let _wakeups = write_txn
                .open_table(WAKEUPS_TABLE)
                .context("Failed to open wakeups table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl ExecutionStore for RedbExecutionStore {
    fn save(&self, record: &ExecutionRecord) -> Result<()> {
        let key = record.id.to_string();
        let value = serde_json::to_vec(record).context("Failed to serialize execution")?;

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut executions = write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("Failed to open table")?;
            executions
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert execution")?;

            // Record and wake-up entry commit together
            let mut wakeups = write_txn
                .open_table(WAKEUPS_TABLE)
                .context("Failed to open table")?;
            match pending_wakeup(record) {
                Some(at) => {
                    wakeups
                        .insert(key.as_str(), at)
                        .context("Failed to insert wakeup")?;
                }
                None => {
                    wakeups
                        .remove(key.as_str())
                        .context("Failed to remove wakeup")?;
                }
            }
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn get(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(EXECUTIONS_TABLE)
            .context("Failed to open table")?;

        let key = id.to_string();
        match table.get(key.as_str()).context("Failed to get execution")? {
            Some(guard) => {
                let record: ExecutionRecord = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize execution")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn list(&self) -> Result<Vec<ExecutionRecord>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(EXECUTIONS_TABLE)
            .context("Failed to open table")?;

        let mut records = Vec::new();
        for item in table.iter().context("Failed to iterate executions")? {
            let (_key, value) = item.context("Failed to read item")?;
            let record: ExecutionRecord = serde_json::from_slice(value.value())
                .context("Failed to deserialize execution")?;
            records.push(record);
        }

        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(records)
    }

    fn due_wakeups(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionId>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(WAKEUPS_TABLE)
            .context("Failed to open table")?;

        let cutoff = now.timestamp_millis();
        let mut due = Vec::new();
        for item in table.iter().context("Failed to iterate wakeups")? {
            let (key, value) = item.context("Failed to read item")?;
            if value.value() <= cutoff {
                let id = key
                    .value()
                    .parse::<ExecutionId>()
                    .context("Corrupt execution id in wakeups table")?;
                due.push((value.value(), id));
            }
        }

        due.sort_by_key(|(at, _)| *at);
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }
}

/// Execution store kept in memory, for tests and embedded use
#[derive(Default)]
pub struct InMemoryExecutionStore {
    records: RwLock<HashMap<ExecutionId, ExecutionRecord>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStore for InMemoryExecutionStore {
    fn save(&self, record: &ExecutionRecord) -> Result<()> {
        self.records
            .write()
            .map_err(|_| anyhow!("execution store lock poisoned"))?
            .insert(record.id, record.clone());
        Ok(())
    }

    fn get(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>> {
        Ok(self
            .records
            .read()
            .map_err(|_| anyhow!("execution store lock poisoned"))?
            .get(id)
            .cloned())
    }

    fn list(&self) -> Result<Vec<ExecutionRecord>> {
        let mut records: Vec<_> = self
            .records
            .read()
            .map_err(|_| anyhow!("execution store lock poisoned"))?
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(records)
    }

    fn due_wakeups(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionId>> {
        let records = self
            .records
            .read()
            .map_err(|_| anyhow!("execution store lock poisoned"))?;
        let mut due: Vec<_> = records
            .values()
            .filter_map(|r| pending_wakeup(r).map(|at| (at, r.id)))
            .filter(|(at, _)| *at <= now.timestamp_millis())
            .collect();
        due.sort_by_key(|(at, _)| *at);
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::types::StateName;
    use tempfile::NamedTempFile;

    fn record() -> ExecutionRecord {
        ExecutionRecord::new(
            "media-pipeline",
            StateName::new("InvokeDataAutomation"),
            ExecutionContext::new(),
            None,
        )
    }

    fn exercise(store: &dyn ExecutionStore) {
        let now = Utc::now();
        let mut waiting = record();
        waiting.cursor = StateName::new("GetJobStatus");
        waiting.wake_at = Some(now - chrono::Duration::seconds(5));
        store.save(&waiting).unwrap();

        let mut later = record();
        later.wake_at = Some(now + chrono::Duration::minutes(2));
        store.save(&later).unwrap();

        assert_eq!(store.due_wakeups(now).unwrap(), vec![waiting.id]);

        let loaded = store.get(&waiting.id).unwrap().unwrap();
        assert_eq!(loaded.cursor, StateName::new("GetJobStatus"));

        // Terminal records leave the wake-up index
        waiting.status = ExecutionStatus::Failed;
        store.save(&waiting).unwrap();
        assert!(store.due_wakeups(now).unwrap().is_empty());

        assert_eq!(store.list().unwrap().len(), 2);
        assert!(store.get(&ExecutionId::new()).unwrap().is_none());
    }

    #[test]
    fn test_redb_execution_store() {
        let temp_file = NamedTempFile::new().unwrap();
        let store = RedbExecutionStore::new(temp_file.path().to_path_buf()).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_redb_store_survives_reopen() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_path_buf();
        let mut rec = record();
        rec.wake_at = Some(Utc::now());

        {
            let store = RedbExecutionStore::new(path.clone()).unwrap();
            store.save(&rec).unwrap();
        }

        let store = RedbExecutionStore::new(path).unwrap();
        let due = store
            .due_wakeups(Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(due, vec![rec.id]);
    }

    #[test]
    fn test_in_memory_execution_store() {
        exercise(&InMemoryExecutionStore::new());
    }
}
