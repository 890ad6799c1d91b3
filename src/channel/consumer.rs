//! The channel consumer drives one file from a known offset through the
//! pipeline: blocks out of the source, records into the sink, offsets
//! into the tracker. Batching and flush state live here and persist for
//! the life of the consumer, so a worker can carry buffered blocks across
//! events.
//!
//! The tracker discipline is the whole point: a path's offset is only
//! ever advanced to the end of a block the sink has acknowledged,
//! directly or through a successful flush, and it is never decreased.

use super::Channel;
use error::{Error, Result};
use sink::Disposition;
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// How a consume attempt ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The file was read to exhaustion.
    Exhausted,
    /// The sink failed; the attempt stopped early and the worker should
    /// back off and retry.
    SinkErrored,
}

/// What one consume attempt did.
#[derive(Clone, Debug)]
pub struct Summary {
    /// How the attempt ended.
    pub outcome: Outcome,
    /// Blocks acknowledged by the sink during the attempt.
    pub count: u64,
    /// Blocks the sink buffered and has not yet acknowledged.
    pub pending: usize,
    /// Bytes in blocks handed to the sink.
    pub bytes: u64,
    /// Blocks that could not be consumed because of an error.
    pub errors: u64,
    /// Wall-clock time the attempt took.
    pub elapsed: Duration,
}

/// What the inner delivery loop decided, once the block iterator's borrow
/// of the file has been dropped.
enum Action {
    Exhausted,
    SinkFail { err: Error, seek_to: u64 },
    Recover { err: Error, seek_to: Option<u64> },
}

/// Consumer state for a channel: lifetime tallies, the pending-block map
/// and the strict-slack error budget.
#[derive(Debug)]
pub struct Consumer {
    /// Blocks acknowledged over the consumer's lifetime.
    pub count: u64,
    /// Bytes handed to the sink over the consumer's lifetime.
    pub bytes: u64,
    /// Blocks lost to errors over the consumer's lifetime.
    pub errors: u64,
    pending: usize,
    slack: i64,
    reset_slack: i64,
    flush_at: Option<Instant>,
    // per path: end offset of the newest pending block, pending count
    pending_offsets: HashMap<PathBuf, (u64, usize)>,
}

impl Consumer {
    /// Make a consumer for `channel`.
    pub fn new(channel: &Channel) -> Consumer {
        Consumer {
            count: 0,
            bytes: 0,
            errors: 0,
            pending: 0,
            slack: i64::from(channel.strict_slack),
            reset_slack: i64::from(channel.strict_slack),
            flush_at: None,
            pending_offsets: HashMap::new(),
        }
    }

    /// Blocks currently buffered in the sink.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// True when buffered blocks have waited long enough that a flush is
    /// due. With no flush timer armed, any buffered block is due.
    pub fn flush_expired(&self) -> bool {
        if self.pending == 0 {
            return false;
        }
        match self.flush_at {
            None => true,
            Some(at) => Instant::now() > at,
        }
    }

    /// Time until the armed flush timer fires, if one is armed.
    pub fn flush_poll(&self) -> Option<Duration> {
        self.flush_at.map(|at| {
            let now = Instant::now();
            if at > now {
                at - now
            } else {
                Duration::from_secs(0)
            }
        })
    }

    /// Force buffered blocks out of the sink and commit their offsets.
    /// On failure every buffered block is counted as errored and nothing
    /// is committed.
    pub fn flush(&mut self, channel: &mut Channel) -> Result<()> {
        if self.pending != 0 {
            let st = Instant::now();
            if let Err(e) = channel.sink.flush() {
                warn!(
                    "{} flush failed with {} block(s) buffered: {}",
                    channel.name, self.pending, e
                );
                self.errors += self.pending as u64;
                self.reset_pending();
                return Err(e);
            }
            for (path, (offset, _)) in self.pending_offsets.drain() {
                channel.tracker.set(&path, offset)?;
            }
            info!(
                "{} flushed {} block(s) in {:?}",
                channel.name,
                self.pending,
                st.elapsed()
            );
        }
        self.flushed();
        Ok(())
    }

    /// Bookkeeping common to every successful flush.
    fn flushed(&mut self) {
        self.count += self.pending as u64;
        self.pending = 0;
        self.flush_at = None;
        self.slack = self.reset_slack;
        self.pending_offsets.clear();
    }

    fn reset_pending(&mut self) {
        self.pending = 0;
        self.flush_at = None;
        self.pending_offsets.clear();
    }

    /// Open `path` and consume it from where the channel left off.
    pub fn consume(
        &mut self,
        channel: &mut Channel,
        path: &Path,
        source: Option<&str>,
    ) -> Result<Summary> {
        let mut fo = fs::File::open(path)?;
        self.call(channel, &mut fo, path, source)
    }

    /// Consume an open stream labeled `path` from where the channel left
    /// off. The stream is positioned at the tracked offset; an untracked
    /// path starts at byte 0 under backfill and at end of stream
    /// otherwise, recording that starting point so later appends are
    /// picked up from it.
    pub fn call<R>(
        &mut self,
        channel: &mut Channel,
        fo: &mut R,
        path: &Path,
        source: Option<&str>,
    ) -> Result<Summary>
    where
        R: Read + Seek,
    {
        let st = Instant::now();
        let idx = self.resolve(channel, path, source)?;
        let len = fo.seek(SeekFrom::End(0))?;
        let offset = if let Some(&(pending, _)) = self.pending_offsets.get(path)
        {
            pending
        } else if let Some(tracked) = channel.tracker.get(path)? {
            if tracked > len {
                warn!(
                    "{}:{} {:?} tracked offset {} beyond end {}, \
                     re-consuming from 0",
                    channel.name,
                    channel.sources[idx].name,
                    path,
                    tracked,
                    len
                );
                channel.tracker.delete(path)?;
                0
            } else {
                tracked
            }
        } else if channel.backfill {
            0
        } else {
            channel.tracker.set(path, len)?;
            len
        };
        fo.seek(SeekFrom::Start(offset))?;
        debug!(
            "{}:{} consuming from {:?} @ {}",
            channel.name, channel.sources[idx].name, path, offset
        );

        let (count, pending, bytes, errors, outcome) =
            self.step(channel, idx, fo, path)?;
        let elapsed = st.elapsed();
        info!(
            "{}:{} consumed {} ({} byte(s)) {} pending from {:?} in {:?}",
            channel.name,
            channel.sources[idx].name,
            count,
            bytes,
            pending,
            path,
            elapsed
        );
        Ok(Summary {
            outcome: outcome,
            count: count,
            pending: pending,
            bytes: bytes,
            errors: errors,
            elapsed: elapsed,
        })
    }

    fn resolve(
        &self,
        channel: &Channel,
        path: &Path,
        source: Option<&str>,
    ) -> Result<usize> {
        match source {
            Some(name) => channel
                .sources
                .iter()
                .position(|s| s.name == name)
                .ok_or_else(|| {
                    Error::Config(format!(
                        "{:?} is not a source of channel {}",
                        name, channel.name
                    ))
                }),
            None => {
                let mut matched = channel
                    .sources
                    .iter()
                    .enumerate()
                    .filter(|&(_, s)| s.match_path(path));
                match (matched.next(), matched.next()) {
                    (Some((idx, _)), None) => Ok(idx),
                    (Some(_), Some(_)) => Err(Error::Config(format!(
                        "{:?} matches multiple sources of channel {}",
                        path, channel.name
                    ))),
                    (None, _) => Err(Error::NoSource {
                        channel: channel.name.clone(),
                        path: path.to_path_buf(),
                    }),
                }
            }
        }
    }

    fn step<R>(
        &mut self,
        channel: &mut Channel,
        idx: usize,
        fo: &mut R,
        path: &Path,
    ) -> Result<(u64, usize, u64, u64, Outcome)>
    where
        R: Read + Seek,
    {
        let mut count = 0u64;
        let mut pending = 0usize;
        let mut bytes = 0u64;
        let mut errors = 0u64;
        let outcome;
        'attempt: loop {
            let action = {
                let Channel {
                    ref name,
                    ref sources,
                    ref mut sink,
                    ref mut tracker,
                    batch_size,
                    flush_frequency,
                    strict,
                    ref form,
                    ref filter,
                    ..
                } = *channel;
                let source = &sources[idx];
                let mut forms = source.forms(&mut *fo, path)?;
                loop {
                    let item = match forms.next() {
                        None => break Action::Exhausted,
                        Some(item) => item,
                    };
                    let (mut record, block) = match item {
                        Ok(pair) => pair,
                        Err(e) => {
                            if let Error::Io(_) = e {
                                error!(
                                    "{}:{} read of {:?} failed: {}",
                                    name, source.name, path, e
                                );
                                return Err(e);
                            }
                            let seek_to = error_end(&e);
                            break Action::Recover {
                                err: e,
                                seek_to: seek_to,
                            };
                        }
                    };
                    // channel-wide form and filter run after the source's
                    if let Some(ref cform) = *form {
                        let mapped = match record.as_object() {
                            Some(fields) => Some(cform.apply(fields, &block)),
                            None => None,
                        };
                        match mapped {
                            Some(Ok(mapped)) => record = mapped,
                            Some(Err(form_errors)) => {
                                if strict {
                                    break Action::Recover {
                                        err: Error::Form {
                                            path: block.path.clone(),
                                            begin: block.begin,
                                            end: block.end,
                                            errors: form_errors,
                                        },
                                        seek_to: Some(block.end),
                                    };
                                }
                                info!(
                                    "{} {:?}[{}:{}] form mapping failed - {}",
                                    name,
                                    block.path,
                                    block.begin,
                                    block.end,
                                    form_errors[0]
                                );
                                continue;
                            }
                            None => {}
                        }
                    }
                    if let Some(ref cfilter) = *filter {
                        if !cfilter(&record, &block) {
                            continue;
                        }
                    }
                    match sink.accept(&record, &block) {
                        Err(e) => {
                            break Action::SinkFail {
                                err: e,
                                seek_to: block.end,
                            }
                        }
                        Ok(Disposition::Pending) => {
                            {
                                let entry = self
                                    .pending_offsets
                                    .entry(block.path.clone())
                                    .or_insert((block.end, 0));
                                entry.0 = block.end;
                                entry.1 += 1;
                            }
                            if self.flush_at.is_none() {
                                if let Some(freq) = flush_frequency {
                                    self.flush_at = Some(Instant::now() + freq);
                                }
                            }
                            self.pending += 1;
                            pending += 1;
                            if self.pending >= batch_size {
                                info!(
                                    "{}:{} reached max batch size {}, \
                                     flushing ...",
                                    name, source.name, batch_size
                                );
                                if let Err(e) = sink.flush() {
                                    break Action::SinkFail {
                                        err: e,
                                        seek_to: block.end,
                                    };
                                }
                                for (p, (o, _)) in self.pending_offsets.drain()
                                {
                                    tracker.set(&p, o)?;
                                }
                                count += pending as u64;
                                pending = 0;
                                self.flushed();
                            }
                        }
                        Ok(Disposition::Acked) => {
                            tracker.set(&block.path, block.end)?;
                            // Same-path blocks the sink had buffered are
                            // covered by this offset and confirmed with it.
                            if let Some((_, n)) =
                                self.pending_offsets.remove(&block.path)
                            {
                                self.pending -= n;
                                self.count += n as u64;
                                count += n as u64;
                                pending = pending.saturating_sub(n);
                            }
                            if self.pending == 0 {
                                self.flush_at = None;
                            }
                            self.count += 1;
                            count += 1;
                            self.slack = self.reset_slack;
                        }
                    }
                    bytes += block.end - block.begin;
                    self.bytes += block.end - block.begin;
                }
            };
            match action {
                Action::Exhausted => {
                    outcome = Outcome::Exhausted;
                    break 'attempt;
                }
                Action::SinkFail { err, seek_to } => {
                    if channel.strict && self.slack <= 0 {
                        return Err(err);
                    }
                    warn!(
                        "{} sink error, skipping block and backing off: {}",
                        channel.name, err
                    );
                    self.slack -= 1;
                    let dropped = self.pending as u64 + 1;
                    errors += dropped;
                    self.errors += dropped;
                    self.reset_pending();
                    pending = 0;
                    channel.tracker.set(path, seek_to)?;
                    fo.seek(SeekFrom::Start(seek_to))?;
                    outcome = Outcome::SinkErrored;
                    break 'attempt;
                }
                Action::Recover { err, seek_to } => {
                    if channel.strict && self.slack <= 0 {
                        return Err(err);
                    }
                    warn!("{} skipping block: {}", channel.name, err);
                    self.slack -= 1;
                    let dropped = self.pending as u64 + 1;
                    errors += dropped;
                    self.errors += dropped;
                    self.reset_pending();
                    pending = 0;
                    match seek_to {
                        Some(at) => {
                            channel.tracker.set(path, at)?;
                            fo.seek(SeekFrom::Start(at))?;
                            continue 'attempt;
                        }
                        None => {
                            outcome = Outcome::Exhausted;
                            break 'attempt;
                        }
                    }
                }
            }
        }
        Ok((count, pending, bytes, errors, outcome))
    }
}

/// The last safe offset an errored block points past, when it names one.
fn error_end(err: &Error) -> Option<u64> {
    match *err {
        Error::PartialBlock { end, .. }
        | Error::BufferOverflow { end, .. }
        | Error::NoMatch { end, .. }
        | Error::Form { end, .. } => Some(end),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::super::{Channel, ChannelConfig};
    use super::*;
    use block::Block;
    use form::Record;
    use sink::{Disposition, Sink, Tally};
    use source::{Source, SourceConfig};
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};
    use tempdir::TempDir;

    const INPUT: &'static [u8] = b"alpha 1\nbeta 2\ngamma 3\ndelta 4\n";

    fn source_config() -> SourceConfig {
        SourceConfig {
            globs: vec!["*/*.log".to_string()],
            exclude_globs: vec![],
            pattern: r"(?P<word>\w+) (?P<n>\d+)".to_string(),
            prefix: None,
            terminal: "\n".to_string(),
            strict: false,
            read_size: 1024,
            buffer_size: 65536,
        }
    }

    fn channel_config() -> ChannelConfig {
        ChannelConfig {
            sources: vec!["words".to_string()],
            sink: "test".to_string(),
            batch_size: 100,
            backfill: true,
            track: true,
            strict: false,
            strict_slack: 0,
            throttle_duration: 30,
            throttle_backoff: 2,
            throttle_cap: 600,
            queue_size: 1000,
            queue_poll: 10.0,
            flush_frequency: None,
        }
    }

    fn channel_with(
        dir: &TempDir,
        config: ChannelConfig,
        sink: Box<dyn Sink>,
    ) -> Channel {
        let source = Source::new("words", source_config()).unwrap();
        Channel::new("test", Some(dir.path()), &config, vec![source], sink)
            .unwrap()
    }

    /// Acks everything, remembering what it saw. The shared log outlives
    /// the channel that swallows the sink.
    struct Recording {
        log: Arc<Mutex<Vec<(Record, u64, u64)>>>,
    }

    impl Sink for Recording {
        fn accept(
            &mut self,
            record: &Record,
            block: &Block,
        ) -> ::error::Result<Disposition> {
            self.log.lock().unwrap().push((
                record.clone(),
                block.begin,
                block.end,
            ));
            Ok(Disposition::Acked)
        }
    }

    /// Fails the first `failures` accepts, acks after that.
    struct Flaky {
        failures: usize,
        seen: Arc<Mutex<Vec<u64>>>,
    }

    impl Sink for Flaky {
        fn accept(
            &mut self,
            _record: &Record,
            block: &Block,
        ) -> ::error::Result<Disposition> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(::error::Error::Sink("injected".to_string()));
            }
            self.seen.lock().unwrap().push(block.begin);
            Ok(Disposition::Acked)
        }
    }

    #[test]
    fn acked_blocks_advance_the_tracker() {
        let dir = TempDir::new("scow-consumer").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut channel = channel_with(
            &dir,
            channel_config(),
            Box::new(Recording { log: log.clone() }),
        );
        let path = Path::new("/x/words.log");
        let mut consumer = channel.consumer();
        let mut fo = Cursor::new(INPUT.to_vec());
        let summary = consumer.call(&mut channel, &mut fo, path, None).unwrap();

        assert_eq!(summary.outcome, Outcome::Exhausted);
        assert_eq!(summary.count, 4);
        assert_eq!(summary.pending, 0);
        assert_eq!(summary.errors, 0);
        assert_eq!(summary.bytes, INPUT.len() as u64);
        assert_eq!(
            channel.tracker.get(path).unwrap(),
            Some(INPUT.len() as u64)
        );
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 4);
        assert_eq!(log[0].0["word"], "alpha");
        assert_eq!((log[3].1, log[3].2), (23, 31));
    }

    #[test]
    fn consuming_twice_yields_nothing_new() {
        let dir = TempDir::new("scow-consumer").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut channel = channel_with(
            &dir,
            channel_config(),
            Box::new(Recording { log: log.clone() }),
        );
        let path = Path::new("/x/words.log");
        let mut consumer = channel.consumer();
        let mut fo = Cursor::new(INPUT.to_vec());
        consumer.call(&mut channel, &mut fo, path, None).unwrap();
        let mut fo = Cursor::new(INPUT.to_vec());
        let second = consumer.call(&mut channel, &mut fo, path, None).unwrap();
        assert_eq!(second.count, 0);
        assert_eq!(log.lock().unwrap().len(), 4);
    }

    #[test]
    fn appended_bytes_are_consumed_from_the_tracked_offset() {
        let dir = TempDir::new("scow-consumer").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut channel = channel_with(
            &dir,
            channel_config(),
            Box::new(Recording { log: log.clone() }),
        );
        let path = Path::new("/x/words.log");
        let mut consumer = channel.consumer();
        let mut fo = Cursor::new(INPUT.to_vec());
        consumer.call(&mut channel, &mut fo, path, None).unwrap();

        let mut grown = INPUT.to_vec();
        grown.extend_from_slice(b"epsilon 5\n");
        let mut fo = Cursor::new(grown.clone());
        let second = consumer.call(&mut channel, &mut fo, path, None).unwrap();
        assert_eq!(second.count, 1);
        assert_eq!(second.bytes, 10);
        assert_eq!(
            channel.tracker.get(path).unwrap(),
            Some(grown.len() as u64)
        );
        assert_eq!(log.lock().unwrap()[4].0["word"], "epsilon");
    }

    #[test]
    fn tail_from_now_records_the_end_offset() {
        let dir = TempDir::new("scow-consumer").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut config = channel_config();
        config.backfill = false;
        let mut channel = channel_with(
            &dir,
            config,
            Box::new(Recording { log: log.clone() }),
        );
        let path = Path::new("/x/words.log");
        let mut consumer = channel.consumer();
        let mut fo = Cursor::new(INPUT.to_vec());
        let summary = consumer.call(&mut channel, &mut fo, path, None).unwrap();
        assert_eq!(summary.count, 0);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(
            channel.tracker.get(path).unwrap(),
            Some(INPUT.len() as u64)
        );
    }

    #[test]
    fn truncated_files_are_reconsumed_from_zero() {
        let dir = TempDir::new("scow-consumer").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut channel = channel_with(
            &dir,
            channel_config(),
            Box::new(Recording { log: log.clone() }),
        );
        let path = Path::new("/x/words.log");
        channel.tracker.set(path, 4096).unwrap();
        let mut consumer = channel.consumer();
        let mut fo = Cursor::new(INPUT.to_vec());
        let summary = consumer.call(&mut channel, &mut fo, path, None).unwrap();
        assert_eq!(summary.count, 4);
        assert_eq!(
            channel.tracker.get(path).unwrap(),
            Some(INPUT.len() as u64)
        );
    }

    #[test]
    fn sink_errors_stop_the_attempt_and_skip_the_block() {
        let dir = TempDir::new("scow-consumer").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut config = channel_config();
        config.strict_slack = 1;
        let mut channel = channel_with(
            &dir,
            config,
            Box::new(Flaky { failures: 1, seen: seen.clone() }),
        );
        let path = Path::new("/x/words.log");
        let mut consumer = channel.consumer();

        let mut fo = Cursor::new(INPUT.to_vec());
        let first = consumer.call(&mut channel, &mut fo, path, None).unwrap();
        assert_eq!(first.outcome, Outcome::SinkErrored);
        assert_eq!(first.errors, 1);
        assert_eq!(first.count, 0);
        // the errored block was skipped past
        assert_eq!(channel.tracker.get(path).unwrap(), Some(8));

        let mut fo = Cursor::new(INPUT.to_vec());
        let second = consumer.call(&mut channel, &mut fo, path, None).unwrap();
        assert_eq!(second.outcome, Outcome::Exhausted);
        assert_eq!(second.count, 3);
        assert_eq!(
            channel.tracker.get(path).unwrap(),
            Some(INPUT.len() as u64)
        );
        assert_eq!(*seen.lock().unwrap(), vec![8, 15, 23]);
    }

    #[test]
    fn strict_without_slack_propagates_sink_errors() {
        let dir = TempDir::new("scow-consumer").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut config = channel_config();
        config.strict = true;
        let mut channel = channel_with(
            &dir,
            config,
            Box::new(Flaky { failures: 1, seen: seen }),
        );
        let path = Path::new("/x/words.log");
        let mut consumer = channel.consumer();
        let mut fo = Cursor::new(INPUT.to_vec());
        match consumer.call(&mut channel, &mut fo, path, None) {
            Err(Error::Sink(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
        // nothing acknowledged, nothing skipped
        assert_eq!(channel.tracker.get(path).unwrap(), None);
    }

    #[test]
    fn batch_size_forces_a_flush() {
        let dir = TempDir::new("scow-consumer").unwrap();
        let mut config = channel_config();
        config.batch_size = 3;
        let mut channel =
            channel_with(&dir, config, Box::new(Tally::new()));
        let path = Path::new("/x/words.log");
        let mut consumer = channel.consumer();
        let mut fo = Cursor::new(INPUT.to_vec());
        let summary = consumer.call(&mut channel, &mut fo, path, None).unwrap();
        // three flushed at the batch boundary, one still buffered
        assert_eq!(summary.count, 3);
        assert_eq!(summary.pending, 1);
        assert_eq!(channel.tracker.get(path).unwrap(), Some(23));

        consumer.flush(&mut channel).unwrap();
        assert_eq!(consumer.pending(), 0);
        assert_eq!(
            channel.tracker.get(path).unwrap(),
            Some(INPUT.len() as u64)
        );
    }

    #[test]
    fn pattern_misses_are_skipped_but_their_bytes_are_covered() {
        let dir = TempDir::new("scow-consumer").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut channel = channel_with(
            &dir,
            channel_config(),
            Box::new(Recording { log: log.clone() }),
        );
        let path = Path::new("/x/words.log");
        let input = b"alpha 1\n!!!\nbeta 2\n???\ngamma 3\ndelta 4\n".to_vec();
        let mut consumer = channel.consumer();
        let mut fo = Cursor::new(input.clone());
        let summary = consumer.call(&mut channel, &mut fo, path, None).unwrap();
        assert_eq!(summary.count, 4);
        assert_eq!(summary.errors, 0);
        assert_eq!(log.lock().unwrap().len(), 4);
        assert_eq!(
            channel.tracker.get(path).unwrap(),
            Some(input.len() as u64)
        );
    }
}
