//! A channel feeds blocks from a collection of sources to one sink,
//! remembering how far it got. It owns the moving parts: the sources'
//! delimiting and extraction, the sink wrapper, the durable offset
//! tracker, batching and flush policy, and the knobs its worker uses for
//! back-off. One channel is pinned to at most one worker thread; nothing
//! here is shared across threads.

use error::{Error, Result};
use form::{FilterFn, Form};
use serde_json;
use sink::Sink;
use source::Source;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use track::Tracker;

mod consumer;
mod lock;
mod worker;

pub use self::consumer::{Consumer, Outcome, Summary};
pub use self::lock::ChannelLock;
pub use self::worker::{Event, WorkerHandle};

fn default_batch_size() -> usize {
    100
}

fn default_throttle_duration() -> u64 {
    30
}

fn default_throttle_backoff() -> u32 {
    2
}

fn default_throttle_cap() -> u64 {
    600
}

fn default_queue_size() -> usize {
    1000
}

fn default_queue_poll() -> f64 {
    10.0
}

/// The configuration struct for a `Channel`.
#[derive(Clone, Debug, Deserialize)]
pub struct ChannelConfig {
    /// Names of the sources the channel consumes from.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Name of the sink blocks are fed to.
    pub sink: String,
    /// Maximum number of buffered blocks before a sink flush is forced.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Whether a newly discovered file is consumed from byte 0 (true) or
    /// from its current end (false). Requires `track`.
    #[serde(default)]
    pub backfill: bool,
    /// Whether offsets are persisted across restarts.
    #[serde(default)]
    pub track: bool,
    /// Whether processing errors propagate once `strict_slack` runs out.
    #[serde(default)]
    pub strict: bool,
    /// Number of consecutive errors tolerated before strict behavior
    /// kicks in.
    #[serde(default)]
    pub strict_slack: u32,
    /// Initial back-off in seconds applied on error.
    #[serde(default = "default_throttle_duration")]
    pub throttle_duration: u64,
    /// Back-off growth factor applied on repeated error.
    #[serde(default = "default_throttle_backoff")]
    pub throttle_backoff: u32,
    /// Ceiling in seconds on any single back-off window.
    #[serde(default = "default_throttle_cap")]
    pub throttle_cap: u64,
    /// Capacity of the worker's event inbox.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Inbox poll timeout in seconds.
    #[serde(default = "default_queue_poll")]
    pub queue_poll: f64,
    /// Seconds buffered blocks may wait before a flush is forced. Unset
    /// means the worker flushes whenever it goes idle.
    #[serde(default)]
    pub flush_frequency: Option<f64>,
}

/// A consumer linking one or more `Source`s to a `Sink`, with its own
/// tracker, batching and back-off configuration.
pub struct Channel {
    /// The channel's name, unique within a process.
    pub name: String,
    /// The sources whose files the channel consumes.
    pub sources: Vec<Source>,
    /// Where records end up.
    pub sink: Box<dyn Sink>,
    /// Path to last-acknowledged-offset map.
    pub tracker: Tracker,
    /// Advisory lock file, present when a state directory is configured.
    pub lock_file: Option<PathBuf>,
    /// Maximum number of buffered blocks before a flush is forced.
    pub batch_size: usize,
    /// Whether newly discovered files are consumed from byte 0.
    pub backfill: bool,
    /// Whether errors propagate once slack runs out.
    pub strict: bool,
    /// Consecutive errors tolerated before strict behavior.
    pub strict_slack: u32,
    /// Initial back-off applied on error.
    pub throttle_duration: Duration,
    /// Back-off growth factor.
    pub throttle_backoff: u32,
    /// Ceiling on any single back-off window.
    pub throttle_cap: Duration,
    /// Capacity of the worker's event inbox.
    pub queue_size: usize,
    /// Inbox poll timeout.
    pub queue_poll: Duration,
    /// How long buffered blocks may wait before a flush is forced.
    pub flush_frequency: Option<Duration>,
    /// Channel-wide form, applied after any source form.
    pub form: Option<Box<dyn Form>>,
    /// Channel-wide filter, applied after any source filter.
    pub filter: Option<FilterFn>,
}

impl ::std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("sources", &self.sources)
            .field("batch_size", &self.batch_size)
            .field("backfill", &self.backfill)
            .field("strict", &self.strict)
            .finish()
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct EditState {
    tracker: BTreeMap<String, u64>,
}

impl Channel {
    /// Make a `Channel` from its parts. `state_dir` is where the tracker
    /// and lock file live; it is required when `config.track` is set.
    pub fn new(
        name: &str,
        state_dir: Option<&Path>,
        config: &ChannelConfig,
        sources: Vec<Source>,
        sink: Box<dyn Sink>,
    ) -> Result<Channel> {
        if sources.is_empty() {
            return Err(Error::Config(format!(
                "channel {} must have at least one source",
                name
            )));
        }
        if config.backfill && !config.track {
            return Err(Error::Config(format!(
                "channel {} cannot backfill if track is false",
                name
            )));
        }
        if config.queue_size == 0 {
            return Err(Error::Config(format!(
                "channel {} queue_size must be >= 1",
                name
            )));
        }
        if config.queue_poll <= 0.0 {
            return Err(Error::Config(format!(
                "channel {} queue_poll must be positive",
                name
            )));
        }
        let tracker = if config.track {
            let state_dir = match state_dir {
                Some(dir) => dir,
                None => {
                    return Err(Error::Config(format!(
                        "channel {} tracks but no state directory is \
                         configured",
                        name
                    )))
                }
            };
            Tracker::open(&state_dir.join(format!("{}.track", name)))?
        } else {
            Tracker::ephemeral()
        };
        let lock_file =
            state_dir.map(|dir| dir.join(format!("{}.lock", name)));
        Ok(Channel {
            name: name.to_string(),
            sources: sources,
            sink: sink,
            tracker: tracker,
            lock_file: lock_file,
            batch_size: config.batch_size,
            backfill: config.backfill,
            strict: config.strict,
            strict_slack: config.strict_slack,
            throttle_duration: Duration::from_secs(config.throttle_duration),
            throttle_backoff: config.throttle_backoff,
            throttle_cap: Duration::from_secs(config.throttle_cap),
            queue_size: config.queue_size,
            queue_poll: Duration::from_secs_f64(config.queue_poll),
            flush_frequency: config
                .flush_frequency
                .map(Duration::from_secs_f64),
            form: None,
            filter: None,
        })
    }

    /// Attach a channel-wide form, applied after any source form.
    pub fn with_form(mut self, form: Box<dyn Form>) -> Channel {
        self.form = Some(form);
        self
    }

    /// Attach a channel-wide filter, applied after any source filter.
    pub fn with_filter(mut self, filter: FilterFn) -> Channel {
        self.filter = Some(filter);
        self
    }

    /// The first source whose globs match `path`, if any.
    pub fn match_path(&self, path: &Path) -> Option<&Source> {
        self.sources.iter().find(|s| s.match_path(path))
    }

    /// The source called `name`, if any.
    pub fn source(&self, name: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// Make a fresh consumer context. Batching and flush state persist
    /// for the life of the context, across files.
    pub fn consumer(&self) -> Consumer {
        Consumer::new(self)
    }

    /// Consume `path` to exhaustion and flush. Blocks already
    /// acknowledged, per the tracker, are not re-consumed.
    pub fn consume(
        &mut self,
        path: &Path,
        source: Option<&str>,
    ) -> Result<Summary> {
        let mut consumer = self.consumer();
        let mut summary = consumer.consume(self, path, source)?;
        consumer.flush(self)?;
        summary.count += summary.pending as u64;
        summary.pending = 0;
        Ok(summary)
    }

    /// Spawn the channel's long-lived worker thread, consuming the
    /// channel. File events enqueued on the returned handle drive
    /// consumption.
    pub fn worker(self) -> Result<WorkerHandle> {
        worker::spawn(self)
    }

    /// Take the channel's advisory lock, used to serialize processes
    /// that would otherwise fight over the same files.
    pub fn lock(
        &self,
        timeout: Option<Duration>,
        poll: Duration,
    ) -> Result<ChannelLock> {
        let lock_file = match self.lock_file {
            Some(ref path) => path.clone(),
            None => {
                return Err(Error::Config(format!(
                    "channel {} has no state directory, nothing to lock",
                    self.name
                )))
            }
        };
        ChannelLock::acquire(&self.name, &lock_file, timeout, poll)
    }

    /// Record `offset` as consumed-up-to for `path`.
    pub fn seek(&mut self, path: &Path, offset: u64) -> Result<u64> {
        self.matched(path)?;
        self.tracker.set(path, offset)?;
        debug!("{} {:?} offset {}", self.name, path, offset);
        Ok(offset)
    }

    /// Forget consumption progress for `path`. Returns true when there
    /// was progress to forget.
    pub fn reset(&mut self, path: &Path) -> Result<bool> {
        self.matched(path)?;
        let found = self.tracker.delete(path)?;
        if found {
            debug!("{} {:?} offset reset", self.name, path);
        }
        Ok(found)
    }

    /// The offset consumption of `path` would begin at: the tracked
    /// offset if one exists, otherwise byte 0 under backfill, otherwise
    /// the file's current end.
    pub fn tell(&self, path: &Path) -> Result<u64> {
        self.matched(path)?;
        if let Some(offset) = self.tracker.get(path)? {
            return Ok(offset);
        }
        if self.backfill {
            return Ok(0);
        }
        Ok(fs::metadata(path)?.len())
    }

    /// Mark `path` consumed up to where consumption would begin, without
    /// consuming anything.
    pub fn touch(&mut self, path: &Path) -> Result<u64> {
        let offset = self.tell(path)?;
        self.seek(path, offset)
    }

    fn matched(&self, path: &Path) -> Result<&Source> {
        match self.match_path(path) {
            Some(source) => Ok(source),
            None => Err(Error::NoSource {
                channel: self.name.clone(),
                path: path.to_path_buf(),
            }),
        }
    }

    /// Write the tracker's state as JSON, the shape `edit_from` accepts.
    pub fn dump<W>(&self, out: &mut W) -> Result<()>
    where
        W: io::Write,
    {
        let mut state = EditState {
            tracker: BTreeMap::new(),
        };
        for (path, offset) in self.tracker.iter()? {
            state
                .tracker
                .insert(path.to_string_lossy().into_owned(), offset);
        }
        serde_json::to_writer_pretty(&mut *out, &state)
            .map_err(|e| Error::Track(e.to_string()))?;
        out.write_all(b"\n")?;
        Ok(())
    }

    /// Replace the tracker's state with JSON of the form
    /// `{"tracker": {"<path>": <offset>, ...}}`. The input is validated
    /// in full before anything is applied; paths absent from the input
    /// are forgotten.
    pub fn edit_from<R>(&mut self, input: R) -> Result<()>
    where
        R: io::Read,
    {
        let state: EditState = serde_json::from_reader(input)
            .map_err(|e| Error::Config(format!("malformed tracker state: {}", e)))?;
        for (path, offset) in &state.tracker {
            self.tracker.set(Path::new(path), *offset)?;
        }
        for (path, _) in self.tracker.iter()? {
            let key = path.to_string_lossy().into_owned();
            if !state.tracker.contains_key(&key) {
                self.tracker.delete(&path)?;
            }
        }
        info!("{} tracker state applied", self.name);
        Ok(())
    }

    /// Edit the tracker's state in `$VISUAL` / `$EDITOR`. Returns true
    /// when changes were applied.
    pub fn edit(&mut self) -> Result<bool> {
        let editor = env::var("VISUAL")
            .or_else(|_| env::var("EDITOR"))
            .map_err(|_| {
                Error::Config("one of VISUAL, EDITOR must be set".to_string())
            })?;
        let raw_path = env::temp_dir()
            .join(format!("scow-{}-{}.json", self.name, process::id()));
        {
            let mut fo = fs::File::create(&raw_path)?;
            self.dump(&mut fo)?;
        }
        let before = fs::metadata(&raw_path)?.modified()?;
        debug!("editing {:?} - {} {:?}", self.name, editor, raw_path);
        let status = process::Command::new(&editor).arg(&raw_path).status()?;
        if !status.success() {
            let _ = fs::remove_file(&raw_path);
            return Err(Error::Config(format!(
                "editor {} exited with {}",
                editor, status
            )));
        }
        if fs::metadata(&raw_path)?.modified()? == before {
            debug!("no state changes detected");
            let _ = fs::remove_file(&raw_path);
            return Ok(false);
        }
        let fo = fs::File::open(&raw_path)?;
        let applied = self.edit_from(fo);
        let _ = fs::remove_file(&raw_path);
        applied.map(|_| true)
    }
}
