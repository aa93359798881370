//! Argon2 passphrase stretching.
//!
//! Derivation can run in process or, to keep its memory use and failures out
//! of the caller, in a copy of the running binary started with
//! [`WORKER_ARG`]. `main` must check [`Mode::from_args`] before doing
//! anything else and hand over to [`worker::run_process`] in worker mode.

pub mod coordinator;
pub mod proto;
pub mod worker;

pub use self::coordinator::{OutOfProcessKdf, WatchdogMonitor};
pub use self::worker::{LockError, ProcessLock};

use self::proto::ProtocolError;
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Reserved argument that turns the binary into an Argon2 worker.
pub const WORKER_ARG: &str = "--argon2-proc";

#[derive(Error, Debug)]
pub enum KdfError {
    #[error("invalid argon2 parameters: {0}")]
    InvalidParams(String),
    #[error("cannot resolve current executable: {0}")]
    CurrentExe(#[source] io::Error),
    #[error("cannot start argon2 worker {}: {source}", exe.display())]
    Spawn { exe: PathBuf, source: io::Error },
    #[error("cannot send request to argon2 worker: {0}")]
    Send(#[source] ProtocolError),
    #[error("cannot receive argon2 request: {0}")]
    Receive(#[source] ProtocolError),
    #[error("no argon2 request received")]
    NoRequest,
    #[error("unexpected {0} message")]
    Unexpected(&'static str),
    #[error("argon2 worker did not finish within {0:?}")]
    Timeout(Duration),
    #[error("argon2 worker did not answer the watchdog within {0:?}")]
    WatchdogExpired(Duration),
    #[error("argon2 worker sent an invalid watchdog response")]
    WatchdogMismatch,
    #[error("argon2 worker failed: {0}")]
    Worker(String),
    #[error("argon2 worker exited unexpectedly ({status}): {stderr}")]
    UnexpectedExit { status: ExitStatus, stderr: String },
    #[error(transparent)]
    Lock(#[from] LockError),
}

pub type Result<T, E = KdfError> = core::result::Result<T, E>;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Argon2Mode {
    Argon2i,
    Argon2id,
}

/// One derivation.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "kebab-case")]
pub struct DeriveJob {
    #[zeroize(skip)]
    pub mode: Argon2Mode,
    #[serde(with = "crate::b64")]
    pub passphrase: Vec<u8>,
    #[serde(with = "crate::b64")]
    pub salt: Vec<u8>,
    pub time_cost: u32,
    pub memory_kib: u32,
    pub threads: u32,
    pub key_len: u32,
}

impl fmt::Debug for DeriveJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeriveJob")
            .field("mode", &self.mode)
            .field("time_cost", &self.time_cost)
            .field("memory_kib", &self.memory_kib)
            .field("threads", &self.threads)
            .field("key_len", &self.key_len)
            .finish_non_exhaustive()
    }
}

pub trait Argon2Kdf {
    fn derive(&self, job: &DeriveJob) -> Result<Zeroizing<Vec<u8>>>;
}

/// Derives in the calling process.
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessKdf;

impl Argon2Kdf for InProcessKdf {
    fn derive(&self, job: &DeriveJob) -> Result<Zeroizing<Vec<u8>>> {
        let invalid = |e: argon2::Error| KdfError::InvalidParams(e.to_string());
        let params = Params::new(
            job.memory_kib,
            job.time_cost,
            job.threads,
            Some(job.key_len as usize),
        )
        .map_err(invalid)?;
        let algorithm = match job.mode {
            Argon2Mode::Argon2i => Algorithm::Argon2i,
            Argon2Mode::Argon2id => Algorithm::Argon2id,
        };
        let mut key = Zeroizing::new(vec![0u8; job.key_len as usize]);
        Argon2::new(algorithm, Version::V0x13, params)
            .hash_password_into(&job.passphrase, &job.salt, key.as_mut_slice())
            .map_err(invalid)?;
        Ok(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Coordinator,
    Worker,
}

impl Mode {
    /// Worker mode is the binary invoked with exactly [`WORKER_ARG`].
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<S> = args.into_iter().take(3).collect();
        match args.as_slice() {
            [_, arg] if arg.as_ref() == WORKER_ARG => Mode::Worker,
            _ => Mode::Coordinator,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_job() -> DeriveJob {
    DeriveJob {
        mode: Argon2Mode::Argon2id,
        passphrase: b"passphrase".to_vec(),
        salt: b"saltsaltsaltsalt".to_vec(),
        time_cost: 1,
        memory_kib: 64,
        threads: 1,
        key_len: 32,
    }
}
