//! The sink contract and a few sinks worth shipping.
//!
//! A sink accepts one record at a time and says whether the record was
//! emitted (`Acked`) or buffered (`Pending`). Buffered records are forced
//! out with `flush`, which either succeeds for everything buffered or
//! fails for everything buffered; there is no partial flush. The channel
//! consumer leans on these answers to decide when a block's offset may be
//! committed to the tracker.

use block::Block;
use error::Result;
use form::Record;

/// What a sink did with a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The record was emitted. Its block may be counted as delivered and
    /// its end offset persisted.
    Acked,
    /// The record was buffered. Its block stays pending until a later
    /// acknowledgement or a successful `flush`.
    Pending,
}

impl Disposition {
    /// True when the record was buffered rather than emitted.
    pub fn is_pending(&self) -> bool {
        *self == Disposition::Pending
    }
}

/// A destination for structured records.
pub trait Sink: Send {
    /// Take one record. `block` is the block the record was cut from,
    /// offered for sinks that key on provenance.
    fn accept(&mut self, record: &Record, block: &Block) -> Result<Disposition>;

    /// Emit everything buffered. Succeeds completely or fails completely.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Prints records to stdout, one JSON document per line. Every record is
/// acknowledged on the spot.
#[derive(Debug, Default)]
pub struct Console;

impl Console {
    /// Make a console sink.
    pub fn new() -> Console {
        Console
    }
}

impl Sink for Console {
    fn accept(&mut self, record: &Record, block: &Block) -> Result<Disposition> {
        println!("{} {}", block.path.display(), record);
        Ok(Disposition::Acked)
    }
}

/// Discards everything, acknowledging as it goes. Useful for draining a
/// backlog you have decided not to ship.
#[derive(Debug, Default)]
pub struct Null;

impl Null {
    /// Make a null sink.
    pub fn new() -> Null {
        Null
    }
}

impl Sink for Null {
    fn accept(&mut self, _record: &Record, _block: &Block) -> Result<Disposition> {
        Ok(Disposition::Acked)
    }
}

/// Buffers and counts. Records are held pending until flush, making this
/// the smallest sink that exercises a channel's batching; it is also handy
/// for dry runs.
#[derive(Debug, Default)]
pub struct Tally {
    pending: usize,
    total: usize,
}

impl Tally {
    /// Make a tally sink.
    pub fn new() -> Tally {
        Tally::default()
    }

    /// How many records have been flushed through.
    pub fn total(&self) -> usize {
        self.total
    }
}

impl Sink for Tally {
    fn accept(&mut self, _record: &Record, _block: &Block) -> Result<Disposition> {
        self.pending += 1;
        Ok(Disposition::Pending)
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending != 0 {
            info!("tally at {} + {} record(s)", self.total, self.pending);
        }
        self.total += self.pending;
        self.pending = 0;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::Value;
    use std::path::Path;

    fn record_and_block() -> (Record, Block) {
        (
            Value::String("r".to_string()),
            Block {
                path: Path::new("/tmp/test.log").to_path_buf(),
                begin: 0,
                end: 2,
                raw: b"r\n".to_vec(),
            },
        )
    }

    #[test]
    fn tally_buffers_until_flush() {
        let (record, block) = record_and_block();
        let mut tally = Tally::new();
        assert!(tally.accept(&record, &block).unwrap().is_pending());
        assert!(tally.accept(&record, &block).unwrap().is_pending());
        assert_eq!(tally.total(), 0);
        tally.flush().unwrap();
        assert_eq!(tally.total(), 2);
    }

    #[test]
    fn null_acks_everything() {
        let (record, block) = record_and_block();
        let mut null = Null::new();
        assert!(!null.accept(&record, &block).unwrap().is_pending());
    }
}
