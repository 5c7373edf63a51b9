//! Background Task Tracking
//!
//! Every accept and read loop runs as a tokio task registered here under the
//! handle of the connection it serves. Finished loops report their handle on
//! a channel and a cleaner task joins them, so completed tasks never pile up.
//! Each loop runs under a supervisor that invokes its exit hook even when the
//! loop panics; shutdown joins whatever is left and reports recorded panics.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::SocketHandle;
use crate::Result;

#[derive(Default)]
struct TaskMap {
    tasks: HashMap<SocketHandle, JoinHandle<()>>,
    closed: bool,
}

pub(crate) struct TaskTracker {
    map: Arc<Mutex<TaskMap>>,
    finished: mpsc::UnboundedSender<SocketHandle>,
    cleaner: Mutex<Option<JoinHandle<()>>>,
    panicked: Arc<Mutex<Vec<SocketHandle>>>,
}

impl TaskTracker {
    /// Create the tracker and spawn its cleaner on the current runtime.
    ///
    /// The cleaner exits once `shutdown` is cancelled.
    pub(crate) fn new(shutdown: CancellationToken) -> Self {
        let map = Arc::new(Mutex::new(TaskMap::default()));
        let (finished, rx) = mpsc::unbounded_channel();
        let cleaner = tokio::spawn(clean_finished(Arc::clone(&map), rx, shutdown));

        Self {
            map,
            finished,
            cleaner: Mutex::new(Some(cleaner)),
            panicked: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn a background loop for `handle`, running `on_exit` once it ends.
    ///
    /// `on_exit` also runs when the loop panics; the panic is recorded and
    /// reported by `shutdown`. Returns false without spawning once shutdown
    /// has begun.
    pub(crate) fn spawn<F, E>(&self, handle: SocketHandle, task: F, on_exit: E) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        let mut map = self.map.lock();
        if map.closed {
            return false;
        }
        let panicked = Arc::clone(&self.panicked);
        let join = tokio::spawn(async move {
            if let Err(e) = tokio::spawn(task).await {
                log_join_error(Some(handle), &e);
                if e.is_panic() {
                    panicked.lock().push(handle);
                }
            }
            on_exit();
        });
        if let Some(previous) = map.tasks.insert(handle, join) {
            // Handles are never reused, so this only happens on a logic error.
            previous.abort();
        }
        true
    }

    /// Report that the loop for `handle` has returned
    pub(crate) fn notify_finished(&self, handle: SocketHandle) {
        let _ = self.finished.send(handle);
    }

    /// Number of loops not yet joined
    pub(crate) fn len(&self) -> usize {
        self.map.lock().tasks.len()
    }

    /// Refuse new loops and join every remaining one.
    ///
    /// Callers cancel the loops first. A loop that panicked is reported as
    /// an error after all others have been joined.
    pub(crate) async fn shutdown(&self) -> Result<()> {
        let cleaner = self.cleaner.lock().take();
        if let Some(cleaner) = cleaner {
            if let Err(e) = cleaner.await {
                log_join_error(None, &e);
            }
        }

        let remaining: Vec<(SocketHandle, JoinHandle<()>)> = {
            let mut map = self.map.lock();
            map.closed = true;
            map.tasks.drain().collect()
        };

        debug!("Joining {} background tasks", remaining.len());

        for (handle, join) in remaining {
            if let Err(e) = join.await {
                log_join_error(Some(handle), &e);
                if e.is_panic() {
                    self.panicked.lock().push(handle);
                }
            }
        }

        let panicked = self.panicked.lock().clone();
        if panicked.is_empty() {
            Ok(())
        } else {
            let handles: Vec<String> = panicked.iter().map(ToString::to_string).collect();
            anyhow::bail!("background task panicked for {}", handles.join(", "))
        }
    }
}

async fn clean_finished(
    map: Arc<Mutex<TaskMap>>,
    mut rx: mpsc::UnboundedReceiver<SocketHandle>,
    shutdown: CancellationToken,
) {
    loop {
        let handle = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(handle) => handle,
                None => break,
            },
        };

        let join = map.lock().tasks.remove(&handle);
        if let Some(join) = join {
            if let Err(e) = join.await {
                log_join_error(Some(handle), &e);
            }
        }
    }
    debug!("Task cleaner stopped");
}

fn log_join_error(handle: Option<SocketHandle>, e: &JoinError) {
    match handle {
        Some(handle) if e.is_panic() => error!("Background task for {} panicked: {}", handle, e),
        Some(handle) => debug!("Background task for {} did not complete: {}", handle, e),
        None if e.is_panic() => error!("Task cleaner panicked: {}", e),
        None => debug!("Task cleaner did not complete: {}", e),
    }
}
