//! Filesystem watching. Notify events are folded into the channel event
//! shape and routed to every worker whose channel claims the path, with
//! a match cache so a busy file does not re-run the glob scan on every
//! write. Delivery is best-effort into each worker's bounded inbox.

use channel::{Event, WorkerHandle};
use crossbeam_channel;
use crossbeam_channel::RecvTimeoutError;
use error::Result;
use notify;
use notify::{EventKind, RecursiveMode, Watcher as NotifyWatcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Routes filesystem events to channel workers.
#[derive(Debug)]
pub struct Watch {
    workers: Vec<WorkerHandle>,
    // path to the workers that claim it, None cached for unclaimed paths
    matches: HashMap<PathBuf, Option<Vec<usize>>>,
}

impl Watch {
    /// Make a router over `workers`.
    pub fn new(workers: Vec<WorkerHandle>) -> Watch {
        Watch {
            workers: workers,
            matches: HashMap::new(),
        }
    }

    /// Watch `paths` until `stop` is set, feeding events to the workers.
    /// Returns the workers so the caller can shut them down.
    pub fn run(
        mut self,
        paths: &[PathBuf],
        recursive: bool,
        stop: Arc<AtomicBool>,
    ) -> Result<Vec<WorkerHandle>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut watcher = notify::recommended_watcher(
            move |result: ::std::result::Result<notify::Event, notify::Error>| {
                let _ = tx.send(result);
            },
        )?;
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        for path in paths {
            watcher.watch(path, mode)?;
            info!("watching {:?}", path);
        }
        info!("entering notification loop");
        while !stop.load(Ordering::Relaxed) {
            match rx.recv_timeout(Duration::from_millis(250)) {
                Ok(Ok(event)) => {
                    for event in translate(&event) {
                        self.route(event);
                    }
                }
                Ok(Err(e)) => warn!("watch error: {}", e),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("exiting notification loop");
        Ok(self.workers)
    }

    /// Hand one event to every worker that claims its path.
    pub fn route(&mut self, event: Event) {
        let claimed = match self.match_workers(&event.path) {
            Some(claimed) => claimed,
            None => {
                if event.is_delete() {
                    self.invalidate(&event.path);
                }
                return;
            }
        };
        for &idx in &claimed {
            self.workers[idx].enqueue(event.clone());
        }
        if event.is_delete() {
            self.invalidate(&event.path);
        }
    }

    fn match_workers(&mut self, path: &Path) -> Option<Vec<usize>> {
        if let Some(cached) = self.matches.get(path) {
            return cached.clone();
        }
        let claimed: Vec<usize> = self
            .workers
            .iter()
            .enumerate()
            .filter(|&(_, worker)| worker.match_path(path))
            .map(|(idx, _)| idx)
            .collect();
        let claimed = if claimed.is_empty() {
            None
        } else {
            Some(claimed)
        };
        self.matches.insert(path.to_path_buf(), claimed.clone());
        claimed
    }

    /// Forget cached matches for a deleted path. A deleted directory
    /// takes everything underneath it along.
    fn invalidate(&mut self, path: &Path) {
        self.matches.remove(path);
        let prefix = path.to_path_buf();
        self.matches.retain(|cached, _| !cached.starts_with(&prefix));
    }
}

/// Fold a notify event into the channel event shape, one per path.
fn translate(event: &notify::Event) -> Vec<Event> {
    let make: fn(&Path) -> Event = match event.kind {
        EventKind::Create(_) => Event::create,
        EventKind::Remove(_) => Event::delete,
        EventKind::Access(_) => return Vec::new(),
        _ => Event::modify,
    };
    event.paths.iter().map(|path| make(path)).collect()
}
