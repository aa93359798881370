//! Worker side of out-of-process derivation.

use super::proto::{self, Request, Response};
use super::{Argon2Kdf, InProcessKdf, KdfError, Result};
use log::debug;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use sha2::{Digest, Sha256};
use std::env;
use std::fmt;
use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use zeroize::Zeroize;

/// Overrides the system-wide lock file, mostly for tests.
pub const LOCK_FILE_ENV: &str = "FDE_UNLOCK_ARGON2_LOCK";
pub const DEFAULT_LOCK_FILE: &str = "/run/fde-unlock/argon2.lock";

const LOCK_RETRY: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum LockError {
    #[error("cannot open lock file {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },
    #[error("cannot lock {}: {source}", path.display())]
    Lock { path: PathBuf, source: Errno },
    #[error("timeout after {timeout:?} waiting for {}", path.display())]
    Timeout { path: PathBuf, timeout: Duration },
    #[error("cannot unlock {}: {source}", path.display())]
    Unlock { path: PathBuf, source: Errno },
}

/// System-wide exclusive lock serializing derivations across processes.
pub struct ProcessLock {
    flock: Flock<File>,
    path: PathBuf,
}

impl fmt::Debug for ProcessLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessLock")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ProcessLock {
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let open_err = |source| LockError::Open {
            path: path.to_owned(),
            source,
        };
        if let Some(parent) = path.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)
                .map_err(open_err)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(path)
            .map_err(open_err)?;

        let deadline = Instant::now() + timeout;
        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(flock) => {
                    debug!("acquired {}", path.display());
                    return Ok(Self {
                        flock,
                        path: path.to_owned(),
                    });
                }
                Err((unlocked, Errno::EAGAIN)) if Instant::now() < deadline => {
                    file = unlocked;
                    thread::sleep(LOCK_RETRY);
                }
                Err((_, Errno::EAGAIN)) => {
                    return Err(LockError::Timeout {
                        path: path.to_owned(),
                        timeout,
                    })
                }
                Err((_, source)) => {
                    return Err(LockError::Lock {
                        path: path.to_owned(),
                        source,
                    })
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) -> Result<(), LockError> {
        let path = self.path;
        self.flock
            .unlock()
            .map(drop)
            .map_err(|(_, source)| LockError::Unlock { path, source })
    }
}

pub type WatchdogHandler = fn(&[u8]) -> Vec<u8>;

pub fn sha256_watchdog(challenge: &[u8]) -> Vec<u8> {
    Sha256::digest(challenge).to_vec()
}

/// Serves one derivation request read from `input`, answering watchdog
/// requests while it runs.
///
/// The lock is returned still held on success; the caller releases it once
/// the key has been handed over.
pub fn wait_for_and_run_request<R, W>(
    mut input: R,
    output: W,
    kdf: &dyn Argon2Kdf,
    watchdog: WatchdogHandler,
    lock_file: &Path,
) -> Result<ProcessLock>
where
    R: Read + Send,
    W: Write + Send,
{
    let (job, lock_timeout) = match proto::read_message(&mut input).map_err(KdfError::Receive)? {
        Some(Request::Derive {
            job,
            lock_timeout_ms,
        }) => (job, Duration::from_millis(lock_timeout_ms)),
        Some(Request::Watchdog { .. }) => return Err(KdfError::Unexpected("watchdog")),
        None => return Err(KdfError::NoRequest),
    };
    let output = Mutex::new(output);

    thread::scope(|scope| {
        scope.spawn(|| answer_watchdog(&mut input, &output, watchdog));

        let result = ProcessLock::acquire(lock_file, lock_timeout)
            .map_err(KdfError::from)
            .and_then(|lock| kdf.derive(&job).map(|key| (lock, key)));

        let mut response = match &result {
            Ok((_, key)) => Response::Derived { key: key.to_vec() },
            Err(e) => Response::Failed {
                message: e.to_string(),
            },
        };
        let sent = {
            let mut output = output.lock().unwrap_or_else(PoisonError::into_inner);
            proto::write_message(&mut *output, &response)
        };
        if let Response::Derived { key } = &mut response {
            key.zeroize();
        }

        let (lock, _key) = result?;
        sent.map_err(KdfError::Send)?;
        Ok(lock)
    })
}

fn answer_watchdog<R: Read, W: Write>(input: &mut R, output: &Mutex<W>, handler: WatchdogHandler) {
    loop {
        match proto::read_message::<_, Request>(input) {
            Ok(Some(Request::Watchdog { challenge })) => {
                let response = Response::Watchdog {
                    response: handler(&challenge),
                };
                let mut output = output.lock().unwrap_or_else(PoisonError::into_inner);
                if let Err(e) = proto::write_message(&mut *output, &response) {
                    debug!("cannot answer watchdog: {e}");
                    return;
                }
            }
            Ok(Some(Request::Derive { .. })) => {
                debug!("ignoring requests after a second derivation job");
                return;
            }
            Ok(None) => return,
            Err(e) => {
                debug!("cannot read watchdog request: {e}");
                return;
            }
        }
    }
}

/// Entry point of the binary in worker mode. Never returns.
pub fn run_process() -> ! {
    let lock_file = env::var_os(LOCK_FILE_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCK_FILE));

    match wait_for_and_run_request(
        io::stdin(),
        io::stdout(),
        &InProcessKdf,
        sha256_watchdog,
        &lock_file,
    ) {
        Ok(lock) => {
            if let Err(e) = lock.release() {
                eprintln!("{e}");
            }
            process::exit(0)
        }
        Err(e) => {
            eprintln!("cannot run argon2 request: {e}");
            process::exit(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::{test_job, DeriveJob};
    use eyre::Result;
    use std::io::Cursor;
    use std::sync::Arc;
    use zeroize::Zeroizing;

    fn requests(requests: &[Request]) -> Result<Cursor<Vec<u8>>> {
        let mut buf = Vec::new();
        for request in requests {
            proto::write_message(&mut buf, request)?;
        }
        Ok(Cursor::new(buf))
    }

    fn responses(buf: Vec<u8>) -> Result<Vec<Response>> {
        let mut reader = Cursor::new(buf);
        let mut out = Vec::new();
        while let Some(response) = proto::read_message(&mut reader)? {
            out.push(response);
        }
        Ok(out)
    }

    fn derive(lock_timeout_ms: u64) -> Request {
        Request::Derive {
            job: test_job(),
            lock_timeout_ms,
        }
    }

    /// Records when each derivation ran.
    struct SlowKdf {
        spans: Mutex<Vec<(Instant, Instant)>>,
    }

    impl Argon2Kdf for SlowKdf {
        fn derive(&self, _job: &DeriveJob) -> crate::kdf::Result<Zeroizing<Vec<u8>>> {
            let start = Instant::now();
            thread::sleep(Duration::from_millis(100));
            self.spans
                .lock()
                .unwrap()
                .push((start, Instant::now()));
            Ok(Zeroizing::new(b"key".to_vec()))
        }
    }

    #[test]
    fn derives_and_reports_key() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut out = Vec::new();
        let lock = wait_for_and_run_request(
            requests(&[derive(1000)])?,
            &mut out,
            &InProcessKdf,
            sha256_watchdog,
            &tmp.path().join("locks/argon2.lock"),
        )?;
        lock.release()?;

        let expected = InProcessKdf.derive(&test_job())?;
        match responses(out)?.as_slice() {
            [Response::Derived { key }] => assert_eq!(key.as_slice(), expected.as_slice()),
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn answers_watchdog_while_running() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut out = Vec::new();
        let challenge = b"challenge".to_vec();
        wait_for_and_run_request(
            requests(&[
                derive(1000),
                Request::Watchdog {
                    challenge: challenge.clone(),
                },
            ])?,
            &mut out,
            &InProcessKdf,
            sha256_watchdog,
            &tmp.path().join("argon2.lock"),
        )?;

        let responses = responses(out)?;
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().any(|r| matches!(r, Response::Derived { .. })));
        assert!(responses.iter().any(
            |r| matches!(r, Response::Watchdog { response } if *response == sha256_watchdog(&challenge))
        ));
        Ok(())
    }

    #[test]
    fn invalid_job_is_reported() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut job = test_job();
        job.memory_kib = 0;
        let mut out = Vec::new();
        let err = wait_for_and_run_request(
            requests(&[Request::Derive {
                job,
                lock_timeout_ms: 1000,
            }])?,
            &mut out,
            &InProcessKdf,
            sha256_watchdog,
            &tmp.path().join("argon2.lock"),
        )
        .unwrap_err();
        assert!(matches!(err, KdfError::InvalidParams(_)));
        assert!(matches!(
            responses(out)?.as_slice(),
            [Response::Failed { message }] if message.starts_with("invalid argon2 parameters")
        ));
        Ok(())
    }

    #[test]
    fn rejects_missing_or_unexpected_first_request() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let lock_file = tmp.path().join("argon2.lock");
        let err = wait_for_and_run_request(
            Cursor::new(Vec::new()),
            Vec::new(),
            &InProcessKdf,
            sha256_watchdog,
            &lock_file,
        )
        .unwrap_err();
        assert!(matches!(err, KdfError::NoRequest));

        let err = wait_for_and_run_request(
            requests(&[Request::Watchdog { challenge: vec![] }])?,
            Vec::new(),
            &InProcessKdf,
            sha256_watchdog,
            &lock_file,
        )
        .unwrap_err();
        assert!(matches!(err, KdfError::Unexpected("watchdog")));
        Ok(())
    }

    #[test]
    fn lock_times_out_while_held() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let lock_file = tmp.path().join("argon2.lock");
        let held = ProcessLock::acquire(&lock_file, Duration::ZERO)?;
        assert_eq!(held.path(), lock_file);

        let mut out = Vec::new();
        let err = wait_for_and_run_request(
            requests(&[derive(50)])?,
            &mut out,
            &InProcessKdf,
            sha256_watchdog,
            &lock_file,
        )
        .unwrap_err();
        assert!(matches!(err, KdfError::Lock(LockError::Timeout { .. })));
        assert!(matches!(responses(out)?.as_slice(), [Response::Failed { .. }]));

        held.release()?;
        ProcessLock::acquire(&lock_file, Duration::ZERO)?.release()?;
        Ok(())
    }

    #[test]
    fn concurrent_derivations_do_not_overlap() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let lock_file = Arc::new(tmp.path().join("argon2.lock"));
        let kdf = Arc::new(SlowKdf {
            spans: Mutex::new(Vec::new()),
        });

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let kdf = Arc::clone(&kdf);
                let lock_file = Arc::clone(&lock_file);
                thread::spawn(move || -> Result<()> {
                    let lock = wait_for_and_run_request(
                        requests(&[derive(5000)])?,
                        Vec::new(),
                        kdf.as_ref(),
                        sha256_watchdog,
                        &lock_file,
                    )?;
                    lock.release()?;
                    Ok(())
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap()?;
        }

        let mut spans = kdf.spans.lock().unwrap().clone();
        assert_eq!(spans.len(), 3);
        spans.sort();
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "derivations overlapped");
        }
        Ok(())
    }
}
