use crate::events::{Event, EventLog, EventType};
use crate::types::ExecutionId;
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use walkdir::WalkDir;

const DEFAULT_FLUSH_THRESHOLD: usize = 64;

/// Event log on disk as gzip-compressed JSON Lines.
///
/// Each execution owns a directory of numbered segments,
/// `<base>/<execution_id>/<seq>.jsonl.gz`. A flush writes one new segment per
/// execution with buffered events; existing segments are never rewritten.
pub struct JsonlEventLog {
    base_path: PathBuf,
    pending: Mutex<Pending>,
    flush_threshold: usize,
}

#[derive(Default)]
struct Pending {
    events: Vec<Event>,
    // Next segment number per execution, discovered lazily from disk
    next_segment: HashMap<ExecutionId, u32>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).with_context(|| {
            format!("Failed to create event log directory {}", base_path.display())
        })?;
        Ok(Self {
            base_path,
            pending: Mutex::new(Pending::default()),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        })
    }

    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold;
        self
    }

    fn execution_dir(&self, execution_id: &ExecutionId) -> PathBuf {
        self.base_path.join(execution_id.to_string())
    }

    /// Segment files of an execution, oldest first
    fn segments(&self, execution_id: &ExecutionId) -> Vec<PathBuf> {
        let dir = self.execution_dir(execution_id);
        if !dir.is_dir() {
            return Vec::new();
        }
        WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry.file_type().is_file()
                    && entry.file_name().to_string_lossy().ends_with(".jsonl.gz")
            })
            .map(|entry| entry.into_path())
            .collect()
    }

    /// Write buffered events out, one segment per execution. Batches that
    /// could not be written stay buffered for the next flush.
    pub async fn flush(&self) -> Result<()> {
        let mut pending = self.pending.lock().await;
        if pending.events.is_empty() {
            return Ok(());
        }

        let mut batches: Vec<(ExecutionId, Vec<Event>)> = Vec::new();
        for event in pending.events.drain(..) {
            match batches.iter_mut().find(|(id, _)| *id == event.execution_id) {
                Some((_, events)) => events.push(event),
                None => batches.push((event.execution_id, vec![event])),
            }
        }

        let mut batches = batches.into_iter();
        while let Some((execution_id, events)) = batches.next() {
            if let Err(e) = self.write_batch(&mut *pending, execution_id, &events).await {
                pending.events = events
                    .into_iter()
                    .chain(batches.by_ref().flat_map(|(_, events)| events))
                    .collect();
                return Err(e);
            }
        }

        Ok(())
    }

    async fn write_batch(
        &self,
        pending: &mut Pending,
        execution_id: ExecutionId,
        events: &[Event],
    ) -> Result<()> {
        let seq = match pending.next_segment.get(&execution_id) {
            Some(seq) => *seq,
            None => self.segments(&execution_id).len() as u32,
        };

        let dir = self.execution_dir(&execution_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .context("Failed to create execution event directory")?;
        write_segment(&dir.join(format!("{seq:06}.jsonl.gz")), events).await?;

        // A finished execution's counter is rediscovered from disk if needed
        if events.iter().any(|e| ends_execution(&e.event_type)) {
            pending.next_segment.remove(&execution_id);
        } else {
            pending.next_segment.insert(execution_id, seq + 1);
        }
        Ok(())
    }
}

fn ends_execution(event_type: &EventType) -> bool {
    matches!(
        event_type,
        EventType::ExecutionSucceeded { .. }
            | EventType::ExecutionFailed { .. }
            | EventType::ExecutionCancelled { .. }
    )
}

/// Events after which an execution stops being driven for a while
fn ends_drive_pass(event_type: &EventType) -> bool {
    matches!(event_type, EventType::WaitScheduled { .. }) || ends_execution(event_type)
}

async fn write_segment(path: &Path, events: &[Event]) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for event in events {
        serde_json::to_writer(&mut encoder, event).context("Failed to serialize event")?;
        encoder.write_all(b"\n").context("Failed to compress event")?;
    }
    let compressed = encoder.finish().context("Failed to finish segment")?;

    tokio::fs::write(path, compressed)
        .await
        .with_context(|| format!("Failed to write event segment {}", path.display()))
}

fn read_segment(path: &Path) -> Result<Vec<Event>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open event segment {}", path.display()))?;

    let mut events = Vec::new();
    for line in BufReader::new(GzDecoder::new(file)).lines() {
        let line = line.context("Failed to read event segment")?;
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&line).context("Failed to parse event")?);
    }
    Ok(events)
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let flush_now = ends_drive_pass(&event.event_type);
        let buffered = {
            let mut pending = self.pending.lock().await;
            pending.events.push(event);
            pending.events.len()
        };

        if flush_now || buffered >= self.flush_threshold {
            self.flush().await?;
        }
        Ok(())
    }

    async fn get_execution_events(&self, execution_id: ExecutionId) -> Result<Vec<Event>> {
        self.flush().await?;

        let mut events = Vec::new();
        for segment in self.segments(&execution_id) {
            events.extend(read_segment(&segment)?);
        }
        Ok(events)
    }
}

/// Event log kept in memory, for tests and embedded use
#[derive(Default)]
pub struct InMemoryEventLog {
    events: Mutex<Vec<Event>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }

    async fn get_execution_events(&self, execution_id: ExecutionId) -> Result<Vec<Event>> {
        Ok(self
            .events
            .lock()
            .await
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .cloned()
            .collect())
    }
}
