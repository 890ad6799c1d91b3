//! The channel worker: a long-lived thread that turns file events into
//! consumption. Events arrive on a bounded inbox from the watcher,
//! coalesce when the channel is backed off, and drive the channel's one
//! consumer context so batching and flush state survive across events.

use super::consumer::{Consumer, Outcome};
use super::Channel;
use crossbeam_channel;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use error::Result;
use source::Matcher;
use std::cmp;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use throttle::Throttle;

/// A file event, or several if merged, associated with one path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    /// Path the event happened to.
    pub path: PathBuf,
    /// Bitwise OR of `CREATE`, `MODIFY` and `DELETE`. More than one bit
    /// is set when events have coalesced.
    pub flags: u32,
}

impl Event {
    /// The path came into existence.
    pub const CREATE: u32 = 1;
    /// The path was written to.
    pub const MODIFY: u32 = 1 << 1;
    /// The path went away.
    pub const DELETE: u32 = 1 << 2;

    /// Make a creation event.
    pub fn create(path: &Path) -> Event {
        Event {
            path: path.to_path_buf(),
            flags: Event::CREATE,
        }
    }

    /// Make a modification event.
    pub fn modify(path: &Path) -> Event {
        Event {
            path: path.to_path_buf(),
            flags: Event::MODIFY,
        }
    }

    /// Make a deletion event.
    pub fn delete(path: &Path) -> Event {
        Event {
            path: path.to_path_buf(),
            flags: Event::DELETE,
        }
    }

    /// True when the creation bit is set.
    pub fn is_create(&self) -> bool {
        self.flags & Event::CREATE != 0
    }

    /// True when the modification bit is set.
    pub fn is_modify(&self) -> bool {
        self.flags & Event::MODIFY != 0
    }

    /// True when the deletion bit is set.
    pub fn is_delete(&self) -> bool {
        self.flags & Event::DELETE != 0
    }

    /// Fold another event for the same path into this one.
    pub fn merge(&mut self, other: &Event) {
        debug_assert_eq!(self.path, other.path);
        self.flags |= other.flags;
    }
}

/// Handle to a spawned worker: the way to feed it events and the way to
/// stop it.
#[derive(Debug)]
pub struct WorkerHandle {
    /// Name of the channel the worker consumes for.
    pub name: String,
    tx: Sender<Event>,
    stop: Arc<AtomicBool>,
    matchers: Vec<Matcher>,
    handle: thread::JoinHandle<()>,
}

impl WorkerHandle {
    /// Offer an event to the worker's inbox. When the inbox is full the
    /// event is dropped with a warning and false is returned.
    pub fn enqueue(&self, event: Event) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(
                    "channel {} worker queue is full, discarding {:?}",
                    self.name, event.path
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// True when any of the channel's sources claims `path`.
    pub fn match_path(&self, path: &Path) -> bool {
        self.matchers.iter().any(|m| m.match_path(path))
    }

    /// Ask the worker to stop after its current event.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Stop the worker and block until it has flushed and exited.
    pub fn shutdown(self) {
        self.stop();
        self.handle.join().expect("failed to join channel worker");
    }
}

/// Spawn the worker thread for `channel`, consuming it.
pub fn spawn(channel: Channel) -> Result<WorkerHandle> {
    let (tx, rx) = crossbeam_channel::bounded(channel.queue_size);
    let stop = Arc::new(AtomicBool::new(false));
    let name = channel.name.clone();
    let matchers = channel.sources.iter().map(|s| s.matcher()).collect();
    let throttle = Throttle::new(
        channel.throttle_duration,
        channel.throttle_backoff,
        channel.throttle_cap,
    );
    let consumer = Consumer::new(&channel);
    let worker_stop = stop.clone();
    let worker_tx = tx.clone();
    let handle = thread::Builder::new()
        .name(format!("scow-channel-{}", name))
        .spawn(move || {
            let mut worker = ChannelWorker {
                channel: channel,
                consumer: consumer,
                throttle: throttle,
                rx: rx,
                tx: worker_tx,
                stop: worker_stop,
                matches: HashMap::new(),
                backlog: HashMap::new(),
            };
            worker.run();
        })?;
    Ok(WorkerHandle {
        name: name,
        tx: tx,
        stop: stop,
        matchers: matchers,
        handle: handle,
    })
}

struct ChannelWorker {
    channel: Channel,
    consumer: Consumer,
    throttle: Throttle,
    rx: Receiver<Event>,
    tx: Sender<Event>,
    stop: Arc<AtomicBool>,
    // path to matched source index, None cached for paths nothing claims
    matches: HashMap<PathBuf, Option<usize>>,
    // events held back while the channel is throttled, merged by path
    backlog: HashMap<PathBuf, Event>,
}

impl ChannelWorker {
    fn run(&mut self) {
        info!("entering channel {} event loop", self.channel.name);
        while !self.stop.load(Ordering::Relaxed) {
            if let Err(e) = self.step() {
                let duration = self.throttle.engage();
                error!(
                    "throttling channel {} worker for {:?}: {}",
                    self.channel.name, duration, e
                );
            }
        }
        if let Err(e) = self.consumer.flush(&mut self.channel) {
            error!(
                "channel {} shutdown flush failed: {}",
                self.channel.name, e
            );
        }
        info!("exiting channel {} event loop", self.channel.name);
    }

    fn step(&mut self) -> Result<bool> {
        if self.throttle.active() {
            let wait = match self.throttle.remaining() {
                Some(remaining) => {
                    cmp::min(remaining, self.channel.queue_poll)
                }
                None => return Ok(false),
            };
            thread::sleep(wait);
            return Ok(false);
        }
        self.drain_backlog();
        if self.consumer.flush_expired() {
            self.consumer.flush(&mut self.channel)?;
        }
        let timeout = match self.consumer.flush_poll() {
            Some(until_flush) => cmp::min(until_flush, self.channel.queue_poll),
            None => self.channel.queue_poll,
        };
        let event = match self.rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                if self.consumer.flush_expired() {
                    self.consumer.flush(&mut self.channel)?;
                }
                return Ok(false);
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.stop.store(true, Ordering::Relaxed);
                return Ok(false);
            }
            Ok(event) => event,
        };
        if self.throttle.active() {
            self.backlog_push(event);
            return Ok(false);
        }
        if event.is_delete() {
            self.on_delete(&event);
        }
        if event.is_create() || event.is_modify() {
            self.on_modify(&event);
        }
        Ok(true)
    }

    fn match_cached(&mut self, path: &Path) -> Option<usize> {
        if let Some(&cached) = self.matches.get(path) {
            return cached;
        }
        let matched = self
            .channel
            .sources
            .iter()
            .position(|s| s.match_path(path));
        self.matches.insert(path.to_path_buf(), matched);
        matched
    }

    fn on_modify(&mut self, event: &Event) {
        let idx = match self.match_cached(&event.path) {
            Some(idx) => idx,
            None => return,
        };
        let source_name = self.channel.sources[idx].name.clone();
        match self.consumer.consume(
            &mut self.channel,
            &event.path,
            Some(&source_name),
        ) {
            Ok(summary) => match summary.outcome {
                Outcome::Exhausted => {
                    if summary.count > 0 {
                        self.throttle.reset();
                    }
                }
                Outcome::SinkErrored => {
                    let duration = self.throttle.engage();
                    warn!(
                        "channel {} sink errored on {:?}, throttling for \
                         {:?} and requeueing",
                        self.channel.name, event.path, duration
                    );
                    self.backlog_push(event.clone());
                }
            },
            Err(ref e) if e.is_not_found() => {
                debug!(
                    "channel {} source {:?} has been deleted",
                    self.channel.name, event.path
                );
                self.on_delete(event);
            }
            Err(e) => {
                let duration = self.throttle.engage();
                error!(
                    "channel {} consume of {:?} failed: {}, throttling for \
                     {:?} and requeueing",
                    self.channel.name, event.path, e, duration
                );
                self.backlog_push(event.clone());
            }
        }
    }

    fn on_delete(&mut self, event: &Event) {
        // The tracker keeps the path's offset: a same-name file showing
        // up again resumes where this one left off.
        self.matches.remove(&event.path);
        let prefix = event.path.clone();
        self.matches.retain(|path, _| !path.starts_with(&prefix));
        self.backlog.remove(&event.path);
    }

    fn backlog_push(&mut self, event: Event) {
        match self.backlog.entry(event.path.clone()) {
            Entry::Occupied(mut held) => held.get_mut().merge(&event),
            Entry::Vacant(slot) => {
                slot.insert(event);
            }
        }
    }

    fn drain_backlog(&mut self) {
        if self.backlog.is_empty() {
            return;
        }
        debug!(
            "draining {} event(s) from channel {} backlog",
            self.backlog.len(),
            self.channel.name
        );
        let paths: Vec<PathBuf> = self.backlog.keys().cloned().collect();
        for path in paths {
            let event = match self.backlog.remove(&path) {
                Some(event) => event,
                None => continue,
            };
            match self.tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    self.backlog.insert(path, event);
                    break;
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn merge_ors_flags() {
        let path = Path::new("/var/log/one.log");
        let mut event = Event::create(path);
        event.merge(&Event::modify(path));
        event.merge(&Event::delete(path));
        assert!(event.is_create());
        assert!(event.is_modify());
        assert!(event.is_delete());
        assert_eq!(
            event.flags,
            Event::CREATE | Event::MODIFY | Event::DELETE
        );
    }

    #[test]
    fn single_flag_events_answer_precisely() {
        let path = Path::new("/var/log/one.log");
        assert!(Event::modify(path).is_modify());
        assert!(!Event::modify(path).is_create());
        assert!(!Event::modify(path).is_delete());
    }
}
