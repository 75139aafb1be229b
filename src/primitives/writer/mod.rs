#![forbid(unsafe_code)]
//! Background page writer.
//!
//! Transactions schedule page images and sync barriers; one worker thread
//! drains the queue in barrier-delimited batches, sorted by page id, and
//! fsyncs at every barrier. Completion is reported through [`WriteTracker`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::primitives::io::FileIo;
use crate::types::{PageId, Result, StoreError};

/// Completion tracker shared by every write and barrier a transaction issues.
///
/// Cloning is cheap; all clones observe the same counter and error.
#[derive(Clone, Default)]
pub struct WriteTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    in_flight: AtomicUsize,
    error: Mutex<Option<StoreError>>,
    done: Condvar,
}

impl WriteTracker {
    /// Creates a tracker with nothing in flight.
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(&self) {
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    fn finish(&self, outcome: Result<()>) {
        let mut error = self.inner.error.lock();
        if let Err(err) = outcome {
            if error.is_none() {
                *error = Some(err);
            }
        }
        if self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.done.notify_all();
        }
    }

    /// Number of scheduled operations that have not completed yet.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Blocks until every scheduled operation finished, returning the first
    /// error any of them observed.
    pub fn wait(&self) -> Result<()> {
        let mut error = self.inner.error.lock();
        while self.inner.in_flight.load(Ordering::Acquire) > 0 {
            self.inner.done.wait(&mut error);
        }
        match error.as_ref() {
            Some(err) => Err(err.duplicate()),
            None => Ok(()),
        }
    }

    /// Returns the first recorded error without waiting.
    pub fn error(&self) -> Option<StoreError> {
        self.inner.error.lock().as_ref().map(StoreError::duplicate)
    }
}

enum Command {
    Write {
        id: PageId,
        data: Vec<u8>,
        tracker: WriteTracker,
    },
    Sync {
        tracker: WriteTracker,
    },
}

impl Command {
    fn tracker(&self) -> &WriteTracker {
        match self {
            Command::Write { tracker, .. } | Command::Sync { tracker } => tracker,
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Command>,
    failed: Option<StoreError>,
    shutdown: bool,
}

struct Shared {
    io: Arc<dyn FileIo>,
    page_size: usize,
    queue: Mutex<QueueState>,
    wakeup: Condvar,
}

/// Single-worker page writer.
pub struct AsyncWriter {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncWriter {
    /// Spawns the worker thread writing `page_size` pages to `io`.
    pub fn start(io: Arc<dyn FileIo>, page_size: usize) -> Result<Self> {
        let shared = Arc::new(Shared {
            io,
            page_size,
            queue: Mutex::new(QueueState::default()),
            wakeup: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("txstore-writer".into())
            .spawn(move || worker_loop(&worker_shared))
            .map_err(StoreError::from)?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queues `data` to be written at page `id`.
    pub fn schedule(&self, tracker: &WriteTracker, id: PageId, data: Vec<u8>) {
        self.push(Command::Write {
            id,
            data,
            tracker: tracker.clone(),
        });
    }

    /// Queues a sync barrier. Writes scheduled before it are durable once the
    /// barrier completes.
    pub fn sync(&self, tracker: &WriteTracker) {
        self.push(Command::Sync {
            tracker: tracker.clone(),
        });
    }

    /// Returns the error that switched the writer into fail-fast mode, if any.
    pub fn failure(&self) -> Option<StoreError> {
        self.shared
            .queue
            .lock()
            .failed
            .as_ref()
            .map(StoreError::duplicate)
    }

    fn push(&self, cmd: Command) {
        cmd.tracker().begin();
        let mut queue = self.shared.queue.lock();
        if let Some(err) = queue.failed.as_ref() {
            let err = err.duplicate();
            drop(queue);
            cmd.tracker().finish(Err(err));
            return;
        }
        if queue.shutdown {
            drop(queue);
            cmd.tracker()
                .finish(Err(StoreError::Invalid("writer is shut down")));
            return;
        }
        queue.pending.push_back(cmd);
        drop(queue);
        self.shared.wakeup.notify_one();
    }

    /// Drains outstanding work and stops the worker thread.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
        }
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("writer.worker_panicked");
            }
        }
    }
}

impl Drop for AsyncWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    let mut batch = Vec::new();
    loop {
        {
            let mut queue = shared.queue.lock();
            while queue.pending.is_empty() && !queue.shutdown {
                shared.wakeup.wait(&mut queue);
            }
            if queue.pending.is_empty() {
                debug!("writer.worker_exit");
                break;
            }
            while let Some(cmd) = queue.pending.pop_front() {
                let barrier = matches!(cmd, Command::Sync { .. });
                batch.push(cmd);
                if barrier {
                    break;
                }
            }
        }
        if let Err(err) = apply_batch(shared, &mut batch) {
            warn!(error = %err, "writer.failed");
            fail_batch(&mut batch, &err);
            fail_pending(shared, err);
        }
    }
}

/// Writes every page in `batch` in ascending page order, then fsyncs if the
/// batch ends in a barrier. Completed commands are removed from `batch`.
fn apply_batch(shared: &Shared, batch: &mut Vec<Command>) -> Result<()> {
    let sync = match batch.last() {
        Some(Command::Sync { .. }) => batch.pop(),
        _ => None,
    };
    batch.sort_by_key(|cmd| match cmd {
        Command::Write { id, .. } => *id,
        Command::Sync { .. } => PageId(u64::MAX),
    });
    let writes = batch.len();
    let mut written = 0;
    let mut failure = None;
    for cmd in batch.iter() {
        if let Command::Write { id, data, .. } = cmd {
            if let Err(err) = shared.io.write_at(id.offset(shared.page_size), data) {
                failure = Some(err);
                break;
            }
        }
        written += 1;
    }
    for cmd in batch.drain(..written) {
        cmd.tracker().finish(Ok(()));
    }
    if let Some(err) = failure {
        batch.extend(sync);
        return Err(err);
    }
    if let Some(cmd) = sync {
        if let Err(err) = shared.io.sync_all() {
            batch.push(cmd);
            return Err(err);
        }
        cmd.tracker().finish(Ok(()));
    }
    debug!(writes, "writer.batch.applied");
    Ok(())
}

fn fail_batch(batch: &mut Vec<Command>, err: &StoreError) {
    for cmd in batch.drain(..) {
        cmd.tracker().finish(Err(err.duplicate()));
    }
}

fn fail_pending(shared: &Shared, err: StoreError) {
    let mut queue = shared.queue.lock();
    let drained: Vec<Command> = queue.pending.drain(..).collect();
    queue.failed = Some(err.duplicate());
    drop(queue);
    for cmd in drained {
        cmd.tracker().finish(Err(err.duplicate()));
    }
}
