//! Scow is a log shipping agent. It tails sets of append-only files,
//! carves them into delimited blocks, structures each block with a regex
//! and an optional typed form, and hauls the results off to a sink. It
//! remembers exactly how far it got -- byte offsets, persisted -- so a
//! restart resumes where it left off, and it backs off rather than drops
//! when a sink misbehaves.
//!
//! Why you might choose to use scow:
//!
//!  * You have log files and somewhere they need to be.
//!  * You need delivery to resume across restarts without re-shipping
//!    what was already acknowledged.
//!  * Your records span multiple lines and your shipper keeps cutting
//!    them in half.
//!  * Your sink falls over sometimes and you would rather back off than
//!    lose bytes.
#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]
extern crate byteorder;
extern crate chrono;
extern crate crossbeam_channel;
extern crate glob;
extern crate libc;
extern crate notify;
extern crate regex;
extern crate serde;
extern crate sled;
extern crate thiserror;
extern crate toml;

#[macro_use]
extern crate log;

#[macro_use]
extern crate serde_derive;

extern crate serde_json;

#[cfg(test)]
extern crate quickcheck;

#[cfg(test)]
extern crate tempdir;

pub mod block;
pub mod channel;
pub mod config;
pub mod error;
pub mod form;
pub mod sink;
pub mod source;
pub mod throttle;
pub mod track;
pub mod watch;
