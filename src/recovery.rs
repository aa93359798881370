//! Recovery keys and how they are asked for.

use log::debug;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const RECOVERY_KEY_LEN: usize = 16;
const GROUPS: usize = RECOVERY_KEY_LEN / 2;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("incorrectly formatted recovery key: expected {GROUPS} groups, got {0}")]
    GroupCount(usize),
    #[error("incorrectly formatted recovery key: invalid group {0:?}")]
    InvalidGroup(String),
    #[error("cannot run {}: {source}", program.display())]
    Spawn { program: PathBuf, source: io::Error },
    #[error("cannot obtain recovery key: {0}")]
    Prompt(String),
}

pub type Result<T, E = RecoveryError> = core::result::Result<T, E>;

/// Written as eight dash-separated groups of five decimal digits, each group
/// a little-endian `u16`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RecoveryKey([u8; RECOVERY_KEY_LEN]);

impl RecoveryKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; RECOVERY_KEY_LEN]> for RecoveryKey {
    fn from(bytes: [u8; RECOVERY_KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl FromStr for RecoveryKey {
    type Err = RecoveryError;

    fn from_str(s: &str) -> Result<Self> {
        let groups: Vec<&str> = s.trim().split('-').collect();
        if groups.len() != GROUPS {
            return Err(RecoveryError::GroupCount(groups.len()));
        }
        let mut key = [0u8; RECOVERY_KEY_LEN];
        for (chunk, group) in key.chunks_exact_mut(2).zip(&groups) {
            let value = Some(group)
                .filter(|g| g.len() == 5 && g.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|g| g.parse::<u16>().ok())
                .ok_or_else(|| RecoveryError::InvalidGroup((*group).to_owned()))?;
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        Ok(Self(key))
    }
}

impl fmt::Display for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chunk) in self.0.chunks_exact(2).enumerate() {
            if i > 0 {
                f.write_str("-")?;
            }
            write!(f, "{:05}", u16::from_le_bytes([chunk[0], chunk[1]]))?;
        }
        Ok(())
    }
}

impl fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecoveryKey(..)")
    }
}

pub trait RecoveryKeyPrompt {
    /// Asks for the recovery key of `name` on `device` and returns the raw
    /// answer.
    fn prompt(&self, name: &str, device: &Path) -> Result<Zeroizing<String>>;
}

/// Prompts through `systemd-ask-password`.
#[derive(Debug, Clone)]
pub struct AskPassword {
    program: PathBuf,
}

impl Default for AskPassword {
    fn default() -> Self {
        Self::new("systemd-ask-password")
    }
}

impl AskPassword {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl RecoveryKeyPrompt for AskPassword {
    fn prompt(&self, name: &str, device: &Path) -> Result<Zeroizing<String>> {
        debug!("asking for recovery key of {name}");
        let output = Command::new(&self.program)
            .arg("--icon")
            .arg("drive-harddisk")
            .arg(format!("--id=fde-unlock:{name}"))
            .arg(format!(
                "Please enter the recovery key for disk {}:",
                device.display()
            ))
            .output()
            .map_err(|source| RecoveryError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        let stdout = Zeroizing::new(output.stdout);
        if !output.status.success() {
            return Err(RecoveryError::Prompt(
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }
        Ok(Zeroizing::new(
            String::from_utf8_lossy(&stdout).trim_end().to_owned(),
        ))
    }
}
