//! Trackers record the progress a channel has made through its source
//! files: a durable map from file path to the first byte the sink has not
//! yet acknowledged.
//!
//! The durable variant is backed by a sled tree, which gives us
//! crash-consistent commits without carrying a database server around.
//! Writes are flushed before they are acknowledged, so an offset the
//! tracker has confirmed will survive the process dying mid-write. The
//! ephemeral variant keeps the same interface for channels that opt out of
//! tracking and persists nothing.

use byteorder::{BigEndian, ByteOrder};
use error::{Error, Result};
use sled;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

enum Store {
    Durable(sled::Db),
    Ephemeral(BTreeMap<String, u64>),
}

/// A map of file path to last-acknowledged byte offset.
pub struct Tracker {
    store: Store,
}

impl ::std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        match self.store {
            Store::Durable(_) => write!(f, "Tracker(durable)"),
            Store::Ephemeral(ref map) => {
                write!(f, "Tracker(ephemeral, {} path(s))", map.len())
            }
        }
    }
}

fn key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn encode(offset: u64) -> [u8; 8] {
    let mut buf = [0; 8];
    BigEndian::write_u64(&mut buf, offset);
    buf
}

impl Tracker {
    /// Open, creating at need, a durable tracker at `path`.
    pub fn open(path: &Path) -> Result<Tracker> {
        debug!("connecting to {:?}", path);
        let db = sled::open(path)?;
        Ok(Tracker {
            store: Store::Durable(db),
        })
    }

    /// Make a tracker that persists nothing.
    pub fn ephemeral() -> Tracker {
        Tracker {
            store: Store::Ephemeral(BTreeMap::new()),
        }
    }

    /// The tracked offset for `path`, if any.
    pub fn get(&self, path: &Path) -> Result<Option<u64>> {
        match self.store {
            Store::Durable(ref db) => match db.get(key(path).as_bytes())? {
                Some(ref v) if v.len() == 8 => {
                    Ok(Some(BigEndian::read_u64(v)))
                }
                Some(_) => Err(Error::Track(format!(
                    "malformed offset for {:?}",
                    path
                ))),
                None => Ok(None),
            },
            Store::Ephemeral(ref map) => Ok(map.get(&key(path)).cloned()),
        }
    }

    /// Record `offset` for `path`. The write is committed before this
    /// returns.
    pub fn set(&mut self, path: &Path, offset: u64) -> Result<()> {
        match self.store {
            Store::Durable(ref db) => {
                db.insert(key(path).as_bytes(), &encode(offset)[..])?;
                db.flush()?;
            }
            Store::Ephemeral(ref mut map) => {
                map.insert(key(path), offset);
            }
        }
        debug!("track {:?} offset {}", path, offset);
        Ok(())
    }

    /// Forget `path`. Returns true when there was something to forget.
    pub fn delete(&mut self, path: &Path) -> Result<bool> {
        let found = match self.store {
            Store::Durable(ref db) => {
                let found = db.remove(key(path).as_bytes())?.is_some();
                db.flush()?;
                found
            }
            Store::Ephemeral(ref mut map) => map.remove(&key(path)).is_some(),
        };
        if found {
            debug!("track {:?} deleted", path);
        }
        Ok(found)
    }

    /// Forget every path that starts with `prefix`. Returns how many
    /// were forgotten.
    pub fn delete_prefix(&mut self, prefix: &str) -> Result<usize> {
        let count = match self.store {
            Store::Durable(ref db) => {
                let mut doomed = Vec::new();
                for kv in db.scan_prefix(prefix.as_bytes()) {
                    let (k, _) = kv?;
                    doomed.push(k);
                }
                let count = doomed.len();
                for k in doomed {
                    db.remove(k)?;
                }
                db.flush()?;
                count
            }
            Store::Ephemeral(ref mut map) => {
                let doomed: Vec<String> = map
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect();
                let count = doomed.len();
                for k in doomed {
                    map.remove(&k);
                }
                count
            }
        };
        if count != 0 {
            debug!("track {:?}* deleted, {} path(s)", prefix, count);
        }
        Ok(count)
    }

    /// A snapshot of every tracked `(path, offset)` pair.
    pub fn iter(&self) -> Result<Vec<(PathBuf, u64)>> {
        match self.store {
            Store::Durable(ref db) => {
                let mut pairs = Vec::new();
                for kv in db.iter() {
                    let (k, v) = kv?;
                    if v.len() != 8 {
                        warn!("skipping malformed tracker entry");
                        continue;
                    }
                    let path = PathBuf::from(String::from_utf8_lossy(&k)
                        .into_owned());
                    pairs.push((path, BigEndian::read_u64(&v)));
                }
                Ok(pairs)
            }
            Store::Ephemeral(ref map) => Ok(map
                .iter()
                .map(|(k, v)| (PathBuf::from(k), *v))
                .collect()),
        }
    }

    /// How many paths are tracked.
    pub fn len(&self) -> usize {
        match self.store {
            Store::Durable(ref db) => db.len(),
            Store::Ephemeral(ref map) => map.len(),
        }
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
