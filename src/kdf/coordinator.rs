//! Coordinator side of out-of-process derivation.

use super::proto::{self, ProtocolError, Request, Response};
use super::worker::{sha256_watchdog, LOCK_FILE_ENV};
use super::{Argon2Kdf, DeriveJob, KdfError, Result, WORKER_ARG};
use log::{debug, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;
use zeroize::Zeroizing;

/// How often the loop wakes up to check deadlines.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);
/// Hard limit for one derivation, lock wait included.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogMonitor {
    pub period: Duration,
    pub response_timeout: Duration,
}

/// Runs each derivation in a fresh copy of `exe` started in worker mode.
#[derive(Debug, Clone)]
pub struct OutOfProcessKdf {
    exe: PathBuf,
    timeout: Duration,
    deadline: Duration,
    watchdog: Option<WatchdogMonitor>,
    lock_file: Option<PathBuf>,
}

struct Pending {
    challenge: Vec<u8>,
    sent: Instant,
}

impl OutOfProcessKdf {
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self {
            exe: exe.into(),
            timeout: DEFAULT_TIMEOUT,
            deadline: DEFAULT_DEADLINE,
            watchdog: None,
            lock_file: None,
        }
    }

    /// Uses the running binary, resolved through `/proc/self/exe`.
    pub fn for_current_exe() -> Result<Self> {
        let exe = fs::canonicalize("/proc/self/exe").map_err(KdfError::CurrentExe)?;
        Ok(Self::new(exe))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_watchdog(mut self, watchdog: WatchdogMonitor) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    pub fn with_lock_file(mut self, lock_file: impl Into<PathBuf>) -> Self {
        self.lock_file = Some(lock_file.into());
        self
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    fn spawn(&self) -> Result<Child> {
        let mut cmd = Command::new(&self.exe);
        cmd.arg(WORKER_ARG)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(lock_file) = &self.lock_file {
            cmd.env(LOCK_FILE_ENV, lock_file);
        }
        debug!("starting argon2 worker {}", self.exe.display());
        cmd.spawn().map_err(|source| KdfError::Spawn {
            exe: self.exe.clone(),
            source,
        })
    }

    /// Sends the job and waits for its key. `None` means the worker closed
    /// its output without answering.
    fn exchange(&self, child: &mut Child, job: &DeriveJob) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| KdfError::Send(missing_pipe("stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| KdfError::Receive(missing_pipe("stdout")))?;

        proto::write_message(
            &mut stdin,
            &Request::Derive {
                job: job.clone(),
                lock_timeout_ms: self.deadline.as_millis().try_into().unwrap_or(u64::MAX),
            },
        )
        .map_err(KdfError::Send)?;

        let responses = spawn_reader(stdout);
        let started = Instant::now();
        let mut next_watchdog = self.watchdog.map(|w| started + w.period);
        let mut pending: Option<Pending> = None;

        loop {
            match responses.recv_timeout(self.timeout) {
                Ok(Ok(Response::Derived { key })) => return Ok(Some(Zeroizing::new(key))),
                Ok(Ok(Response::Failed { message })) => return Err(KdfError::Worker(message)),
                Ok(Ok(Response::Watchdog { response })) => match pending.take() {
                    Some(p) if response == sha256_watchdog(&p.challenge) => {
                        debug!("argon2 watchdog answered in {:?}", p.sent.elapsed())
                    }
                    Some(_) => return Err(KdfError::WatchdogMismatch),
                    None => return Err(KdfError::Unexpected("watchdog response")),
                },
                Ok(Err(e)) => return Err(KdfError::Receive(e)),
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
                Err(RecvTimeoutError::Timeout) => {}
            }

            let now = Instant::now();
            if now.duration_since(started) >= self.deadline {
                return Err(KdfError::Timeout(self.deadline));
            }
            if let Some(monitor) = self.watchdog {
                if let Some(p) = &pending {
                    if now.duration_since(p.sent) >= monitor.response_timeout {
                        return Err(KdfError::WatchdogExpired(monitor.response_timeout));
                    }
                } else if next_watchdog.map_or(false, |at| now >= at) {
                    pending = Some(send_watchdog(&mut stdin)?);
                    next_watchdog = Some(now + monitor.period);
                }
            }
        }
    }
}

impl Argon2Kdf for OutOfProcessKdf {
    fn derive(&self, job: &DeriveJob) -> Result<Zeroizing<Vec<u8>>> {
        let mut child = self.spawn()?;
        let key = match self.exchange(&mut child, job) {
            Ok(key) => key,
            Err(e) => {
                if let Err(kill_err) = child.kill() {
                    warn!("cannot kill argon2 worker: {kill_err}");
                }
                let _ = child.wait();
                return Err(e);
            }
        };

        let output = child
            .wait_with_output()
            .map_err(|e| KdfError::Receive(e.into()))?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        match key {
            Some(key) if output.status.success() => Ok(key),
            Some(_) => Err(KdfError::UnexpectedExit {
                status: output.status,
                stderr,
            }),
            None if output.status.code() == Some(1) && !stderr.is_empty() => {
                Err(KdfError::Worker(stderr))
            }
            None => Err(KdfError::UnexpectedExit {
                status: output.status,
                stderr,
            }),
        }
    }
}

fn missing_pipe(name: &str) -> ProtocolError {
    io::Error::new(io::ErrorKind::BrokenPipe, format!("no {name} pipe")).into()
}

fn send_watchdog(stdin: &mut ChildStdin) -> Result<Pending> {
    let challenge = Uuid::new_v4().as_bytes().to_vec();
    proto::write_message(
        stdin,
        &Request::Watchdog {
            challenge: challenge.clone(),
        },
    )
    .map_err(KdfError::Send)?;
    Ok(Pending {
        challenge,
        sent: Instant::now(),
    })
}

fn spawn_reader<R: io::Read + Send + 'static>(
    mut reader: R,
) -> Receiver<Result<Response, ProtocolError>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || loop {
        match proto::read_message(&mut reader) {
            Ok(Some(response)) => {
                if tx.send(Ok(response)).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        }
    });
    rx
}
