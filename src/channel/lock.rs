//! Advisory channel locking. A channel's lock file serializes processes
//! that would otherwise consume the same files: the daemon takes it
//! before spawning a worker, and one-shot commands take it before
//! touching the tracker. The lock is released on drop, on every exit
//! path.

use error::{Error, Result};
use libc;
use std::fs;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// An acquired advisory exclusive lock on a channel's lock file.
#[derive(Debug)]
pub struct ChannelLock {
    channel: String,
    path: PathBuf,
    file: fs::File,
}

fn flock(file: &fs::File, operation: libc::c_int) -> io::Result<()> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

impl ChannelLock {
    /// Take the exclusive lock at `path`, creating the zero-length file
    /// at need. With no `timeout` a held lock fails the attempt
    /// immediately; otherwise acquisition is retried every `poll` until
    /// the timeout runs out.
    pub fn acquire(
        channel: &str,
        path: &Path,
        timeout: Option<Duration>,
        poll: Duration,
    ) -> Result<ChannelLock> {
        debug!("acquiring channel {} lock ({:?}) ...", channel, path);
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
                Ok(()) => break,
                Err(ref e)
                    if e.raw_os_error() == Some(libc::EWOULDBLOCK)
                        || e.raw_os_error() == Some(libc::EACCES) =>
                {
                    let expired = match deadline {
                        None => true,
                        Some(at) => Instant::now() >= at,
                    };
                    if expired {
                        return Err(Error::CannotLock {
                            channel: channel.to_string(),
                            path: path.to_path_buf(),
                            timeout: timeout,
                            attempts: attempts,
                        });
                    }
                    debug!(
                        "channel {} lock ({:?}) held elsewhere on attempt \
                         {}, sleeping {:?}",
                        channel, path, attempts, poll
                    );
                    thread::sleep(poll);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        debug!(
            "channel {} locked ({:?}) on attempt {}",
            channel, path, attempts
        );
        Ok(ChannelLock {
            channel: channel.to_string(),
            path: path.to_path_buf(),
            file: file,
        })
    }
}

impl Drop for ChannelLock {
    fn drop(&mut self) {
        if let Err(e) = flock(&self.file, libc::LOCK_UN) {
            warn!(
                "channel {} unlock ({:?}) failed: {}",
                self.channel, self.path, e
            );
        } else {
            debug!("channel {} unlocked ({:?})", self.channel, self.path);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn second_acquisition_fails_while_held() {
        let dir = TempDir::new("scow-lock").unwrap();
        let path = dir.path().join("test.lock");
        let held = ChannelLock::acquire(
            "test",
            &path,
            None,
            Duration::from_millis(10),
        ).unwrap();
        match ChannelLock::acquire(
            "test",
            &path,
            None,
            Duration::from_millis(10),
        ) {
            Err(Error::CannotLock { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("unexpected: {:?}", other),
        }
        drop(held);
        assert!(
            ChannelLock::acquire(
                "test",
                &path,
                None,
                Duration::from_millis(10)
            ).is_ok()
        );
    }

    #[test]
    fn timeout_retries_until_expiry() {
        let dir = TempDir::new("scow-lock").unwrap();
        let path = dir.path().join("test.lock");
        let _held = ChannelLock::acquire(
            "test",
            &path,
            None,
            Duration::from_millis(10),
        ).unwrap();
        let st = Instant::now();
        match ChannelLock::acquire(
            "test",
            &path,
            Some(Duration::from_millis(50)),
            Duration::from_millis(10),
        ) {
            Err(Error::CannotLock { attempts, .. }) => assert!(attempts > 1),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(st.elapsed() >= Duration::from_millis(50));
    }
}
