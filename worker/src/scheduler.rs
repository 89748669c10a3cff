//! Periodic submissions.
//!
//! Every configured dist string gets a Discover message every
//! `schedule_discover` seconds, and every configured project a Publish
//! (with results) every `schedule_report` seconds. An interval of zero
//! disables the entry. A message identical to one still waiting in its
//! queue is not submitted again.

use crate::error::Result;
use crate::message::StageMessage;
use crate::queue::{PendingState, TaskQueue};
use log::{debug, error, info};
use rebuilder_common::config::Config;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry {
    message: StageMessage,
    every: Duration,
    next_due: Instant,
}

/// Timetable of periodic messages.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    entries: Vec<Entry>,
}

impl Scheduler {
    /// Builds the timetable of `config`; every entry is first due at `now`.
    #[must_use]
    pub fn from_config(config: &Config, now: Instant) -> Self {
        let mut entries = Vec::new();
        for project in config.projects() {
            for dist in &project.dists {
                entries.push(Entry {
                    message: StageMessage::Discover {
                        dist: dist.clone(),
                        force_retry: false,
                    },
                    every: project.schedule_discover,
                    next_due: now,
                });
            }
            entries.push(Entry {
                message: StageMessage::Publish {
                    task: None,
                    project: Some(project.project.as_str().to_owned()),
                    upload_results: true,
                },
                every: project.schedule_report,
                next_due: now,
            });
        }
        entries.retain(|entry| {
            let enabled = !entry.every.is_zero();
            if !enabled {
                debug!("{:?}: periodic submission disabled", entry.message);
            }
            enabled
        });
        Self { entries }
    }

    /// Number of periodic entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest due time.
    #[must_use]
    pub fn next_due(&self) -> Option<Instant> {
        self.entries.iter().map(|entry| entry.next_due).min()
    }

    /// Submits every entry due at `now` and returns how many were queued.
    ///
    /// # Errors
    ///
    /// Returns `Queue` errors; entries after the failing one stay due.
    pub fn tick(&mut self, now: Instant, queue: &dyn TaskQueue) -> Result<usize> {
        let mut submitted = 0;
        for entry in &mut self.entries {
            if entry.next_due > now {
                continue;
            }
            if submit_once(queue, entry.message.clone())? {
                submitted += 1;
            }
            entry.next_due = now + entry.every;
        }
        Ok(submitted)
    }

    /// Ticks until `stop` is set, sleeping at most `poll` between ticks.
    pub fn run(&mut self, queue: &dyn TaskQueue, poll: Duration, stop: &AtomicBool) {
        info!("scheduler started with {} periodic submission(s)", self.len());
        while !stop.load(Ordering::Relaxed) {
            let now = Instant::now();
            if let Err(err) = self.tick(now, queue) {
                error!("scheduler: {err}");
            }
            let wait = self
                .next_due()
                .map_or(poll, |due| due.saturating_duration_since(Instant::now()).min(poll));
            thread::sleep(wait.max(Duration::from_millis(10)));
        }
    }
}

/// Enqueues `message` unless an identical message is already waiting in its
/// queue. Returns `true` when the message was queued.
///
/// # Errors
///
/// Returns `Queue` errors.
pub fn submit_once(queue: &dyn TaskQueue, message: StageMessage) -> Result<bool> {
    let waiting = queue
        .pending(message.stage())?
        .into_iter()
        .any(|pending| pending.state != PendingState::Inflight && pending.message == message);
    if waiting {
        debug!("{} message already waiting", message.stage());
        return Ok(false);
    }
    queue.enqueue(message)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Stage;
    use crate::queue::MemoryQueue;
    use camino::Utf8Path;
    use rstest::rstest;

    const CONFIG: &str = "[common]\nschedule_discover = 1800\nschedule_report = 300\n\n\
        [project.debian]\ndist = [\"bullseye+essential.amd64\", \"bullseye+essential.all\"]\n\n\
        [project.fedora]\nschedule_report = 0\n";

    fn scheduler(now: Instant) -> Scheduler {
        let config = Config::from_toml_str(Utf8Path::new("t.toml"), CONFIG).expect("config");
        Scheduler::from_config(&config, now)
    }

    #[rstest]
    fn builds_one_entry_per_dist_and_project() {
        let now = Instant::now();
        let scheduler = scheduler(now);
        assert_eq!(scheduler.len(), 3);
        assert_eq!(scheduler.next_due(), Some(now));
    }

    #[rstest]
    fn tick_submits_due_entries_once() {
        let now = Instant::now();
        let mut scheduler = scheduler(now);
        let queue = MemoryQueue::new();

        assert_eq!(scheduler.tick(now, &queue).expect("tick"), 3);
        assert_eq!(queue.len(Stage::Discover), 2);
        assert_eq!(queue.len(Stage::Publish), 1);

        let later = now + Duration::from_secs(300);
        assert_eq!(scheduler.tick(later, &queue).expect("tick"), 0);
        assert_eq!(queue.len(Stage::Publish), 1);
        assert_eq!(scheduler.next_due(), Some(later + Duration::from_secs(300)));
    }

    #[rstest]
    fn reserved_messages_do_not_block_resubmission() {
        let queue = MemoryQueue::new();
        let message = StageMessage::Discover {
            dist: "bullseye.amd64".to_owned(),
            force_retry: false,
        };
        assert!(submit_once(&queue, message.clone()).expect("first"));
        assert!(!submit_once(&queue, message.clone()).expect("duplicate"));

        queue.reserve(Stage::Discover).expect("reserve");
        assert!(submit_once(&queue, message).expect("after reserve"));
    }
}
