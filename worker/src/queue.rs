//! Per-stage task queues.
//!
//! Stages communicate only by pushing [`StageMessage`]s onto the queue of
//! the next stage. A message is reserved by one worker, acknowledged once
//! the stage returned, and may carry a `not_before` time for delayed
//! retries. [`TaskQueue::pending`] exposes queued, scheduled and in-flight
//! payloads for the advisory duplicate-submission checks.

use crate::error::{Result, StageError};
use crate::message::{Stage, StageMessage};
use camino::{Utf8Path, Utf8PathBuf};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A queued message with its delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Queue-unique identifier.
    pub id: u64,
    /// Delivery attempts made before this one.
    pub attempts: u32,
    /// Earliest delivery time, milliseconds since the Unix epoch.
    pub not_before: u64,
    /// Payload.
    pub message: StageMessage,
}

/// Where a pending message currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// Deliverable now.
    Queued,
    /// Waiting for its delay to elapse.
    Scheduled,
    /// Reserved by a worker.
    Inflight,
}

/// A message that has not been acknowledged yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    /// Delivery state.
    pub state: PendingState,
    /// Payload.
    pub message: StageMessage,
}

/// Persistent task queue with one logical queue per stage.
pub trait TaskQueue: Send + Sync {
    /// Pushes `message` onto its stage queue, deliverable after `delay`.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Queue`] when the message cannot be stored.
    fn push(&self, message: StageMessage, delay: Duration, attempts: u32) -> Result<u64>;

    /// Reserves the oldest deliverable message of `stage`.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Queue`] when the queue cannot be read.
    fn reserve(&self, stage: Stage) -> Result<Option<Envelope>>;

    /// Acknowledges a reserved message, removing it for good.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Queue`] when the message cannot be removed.
    fn ack(&self, stage: Stage, id: u64) -> Result<()>;

    /// Lists every unacknowledged message of `stage`.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Queue`] when the queue cannot be read.
    fn pending(&self, stage: Stage) -> Result<Vec<PendingMessage>>;

    /// Pushes a message for immediate delivery.
    ///
    /// # Errors
    ///
    /// See [`TaskQueue::push`].
    fn enqueue(&self, message: StageMessage) -> Result<u64> {
        self.push(message, Duration::ZERO, 0)
    }

    /// Pushes a message deliverable after `delay`.
    ///
    /// # Errors
    ///
    /// See [`TaskQueue::push`].
    fn enqueue_after(&self, message: StageMessage, delay: Duration) -> Result<u64> {
        self.push(message, delay, 0)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

fn deadline(delay: Duration) -> u64 {
    now_millis().saturating_add(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX))
}

fn state_of(envelope: &Envelope, now: u64) -> PendingState {
    if envelope.not_before <= now {
        PendingState::Queued
    } else {
        PendingState::Scheduled
    }
}

/// In-process queue; contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    next_id: AtomicU64,
    queued: Mutex<BTreeMap<Stage, VecDeque<Envelope>>>,
    inflight: Mutex<BTreeMap<Stage, Vec<Envelope>>>,
}

impl MemoryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unacknowledged messages of `stage`.
    #[must_use]
    pub fn len(&self, stage: Stage) -> usize {
        self.pending(stage).map_or(0, |pending| pending.len())
    }

    /// Returns `true` when no stage holds a message.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        Stage::ALL.into_iter().all(|stage| self.len(stage) == 0)
    }
}

impl TaskQueue for MemoryQueue {
    fn push(&self, message: StageMessage, delay: Duration, attempts: u32) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope {
            id,
            attempts,
            not_before: deadline(delay),
            message,
        };
        let mut queued = self.queued.lock().map_err(StageError::queue)?;
        queued
            .entry(envelope.message.stage())
            .or_default()
            .push_back(envelope);
        Ok(id)
    }

    fn reserve(&self, stage: Stage) -> Result<Option<Envelope>> {
        let now = now_millis();
        let mut queued = self.queued.lock().map_err(StageError::queue)?;
        let Some(stage_queue) = queued.get_mut(&stage) else {
            return Ok(None);
        };
        let Some(position) = stage_queue.iter().position(|e| e.not_before <= now) else {
            return Ok(None);
        };
        let Some(envelope) = stage_queue.remove(position) else {
            return Ok(None);
        };
        drop(queued);

        let mut inflight = self.inflight.lock().map_err(StageError::queue)?;
        inflight.entry(stage).or_default().push(envelope.clone());
        Ok(Some(envelope))
    }

    fn ack(&self, stage: Stage, id: u64) -> Result<()> {
        let mut inflight = self.inflight.lock().map_err(StageError::queue)?;
        if let Some(reserved) = inflight.get_mut(&stage) {
            reserved.retain(|envelope| envelope.id != id);
        }
        Ok(())
    }

    fn pending(&self, stage: Stage) -> Result<Vec<PendingMessage>> {
        let now = now_millis();
        let mut pending = Vec::new();
        {
            let queued = self.queued.lock().map_err(StageError::queue)?;
            pending.extend(queued.get(&stage).into_iter().flatten().map(|envelope| {
                PendingMessage {
                    state: state_of(envelope, now),
                    message: envelope.message.clone(),
                }
            }));
        }
        let inflight = self.inflight.lock().map_err(StageError::queue)?;
        pending.extend(
            inflight
                .get(&stage)
                .into_iter()
                .flatten()
                .map(|envelope| PendingMessage {
                    state: PendingState::Inflight,
                    message: envelope.message.clone(),
                }),
        );
        Ok(pending)
    }
}

/// Queue spooled to disk so that messages survive restarts.
///
/// Each message is a JSON [`Envelope`] named `{not_before}-{id}.json` in
/// `{state_dir}/queue/{stage}/`. Reserving renames the file into
/// `{stage}/inflight/{id}.json`; the rename is the claim, so concurrent
/// workers never deliver one message twice.
#[derive(Debug)]
pub struct SpoolQueue {
    root: Utf8PathBuf,
    next_id: AtomicU64,
}

impl SpoolQueue {
    /// Opens (and creates) the spool below `state_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Queue`] when the directories cannot be created.
    pub fn open(state_dir: &Utf8Path) -> Result<Self> {
        let root = state_dir.join("queue");
        for stage in Stage::ALL {
            let inflight = root.join(stage.as_str()).join("inflight");
            fs::create_dir_all(&inflight)
                .map_err(|err| StageError::queue(format!("cannot create {inflight}: {err}")))?;
        }
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX));
        Ok(Self {
            root,
            next_id: AtomicU64::new(seed),
        })
    }

    /// Moves every in-flight message back to its queue and returns how many
    /// were restored. Call once at start-up, before workers run.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Queue`] when a message cannot be moved.
    pub fn recover(&self) -> Result<usize> {
        let mut restored = 0;
        for stage in Stage::ALL {
            for (path, envelope) in read_envelopes(&self.inflight_dir(stage))? {
                let target = self.queued_path(stage, &envelope);
                fs::rename(&path, &target).map_err(|err| {
                    StageError::queue(format!("cannot restore {path} to {target}: {err}"))
                })?;
                restored += 1;
            }
        }
        Ok(restored)
    }

    fn stage_dir(&self, stage: Stage) -> Utf8PathBuf {
        self.root.join(stage.as_str())
    }

    fn inflight_dir(&self, stage: Stage) -> Utf8PathBuf {
        self.stage_dir(stage).join("inflight")
    }

    fn queued_path(&self, stage: Stage, envelope: &Envelope) -> Utf8PathBuf {
        self.stage_dir(stage)
            .join(format!("{:020}-{:020}.json", envelope.not_before, envelope.id))
    }

    fn inflight_path(&self, stage: Stage, id: u64) -> Utf8PathBuf {
        self.inflight_dir(stage).join(format!("{id:020}.json"))
    }
}

impl TaskQueue for SpoolQueue {
    fn push(&self, message: StageMessage, delay: Duration, attempts: u32) -> Result<u64> {
        let stage = message.stage();
        let mut envelope = Envelope {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            attempts,
            not_before: deadline(delay),
            message,
        };
        loop {
            let path = self.queued_path(stage, &envelope);
            let payload = serde_json::to_vec(&envelope).map_err(StageError::queue)?;
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(&payload)
                        .map_err(|err| StageError::queue(format!("cannot write {path}: {err}")))?;
                    return Ok(envelope.id);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    envelope.id = self.next_id.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    return Err(StageError::queue(format!("cannot create {path}: {err}")));
                }
            }
        }
    }

    fn reserve(&self, stage: Stage) -> Result<Option<Envelope>> {
        let now = now_millis();
        for (path, envelope) in read_envelopes(&self.stage_dir(stage))? {
            if envelope.not_before > now {
                // Names sort by delivery time; nothing later is due either.
                break;
            }
            let claimed = self.inflight_path(stage, envelope.id);
            match fs::rename(&path, &claimed) {
                Ok(()) => return Ok(Some(envelope)),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(StageError::queue(format!("cannot reserve {path}: {err}")));
                }
            }
        }
        Ok(None)
    }

    fn ack(&self, stage: Stage, id: u64) -> Result<()> {
        let path = self.inflight_path(stage, id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StageError::queue(format!("cannot ack {path}: {err}"))),
        }
    }

    fn pending(&self, stage: Stage) -> Result<Vec<PendingMessage>> {
        let now = now_millis();
        let queued = read_envelopes(&self.stage_dir(stage))?
            .into_iter()
            .map(|(_, envelope)| PendingMessage {
                state: state_of(&envelope, now),
                message: envelope.message,
            });
        let inflight = read_envelopes(&self.inflight_dir(stage))?
            .into_iter()
            .map(|(_, envelope)| PendingMessage {
                state: PendingState::Inflight,
                message: envelope.message,
            });
        Ok(queued.chain(inflight).collect())
    }
}

/// Reads the envelopes of one directory in file-name order. Files that
/// vanish or fail to parse are skipped.
fn read_envelopes(dir: &Utf8Path) -> Result<Vec<(Utf8PathBuf, Envelope)>> {
    let entries = match dir.read_dir_utf8() {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StageError::queue(format!("cannot list {dir}: {err}"))),
    };
    let mut paths: Vec<Utf8PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.into_path())
        .filter(|path| path.extension() == Some("json"))
        .collect();
    paths.sort();

    let mut envelopes = Vec::with_capacity(paths.len());
    for path in paths {
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(StageError::queue(format!("cannot read {path}: {err}"))),
        };
        match serde_json::from_str::<Envelope>(&text) {
            Ok(envelope) => envelopes.push((path, envelope)),
            Err(err) => warn!("skipping malformed queue entry {path}: {err}"),
        }
    }
    Ok(envelopes)
}
