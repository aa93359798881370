//! TPM access used by the unlock paths.
//!
//! The orchestrator only needs to know whether a usable TPM exists, to unseal
//! the key described by a sealed key file and to block further unsealing by
//! extending the initramfs PCR. [`NoTpm`] is the connector for machines (and
//! builds) without one; the `tpm` feature adds a tss-esapi backed connector.

use self::pcr::{PcrError, PcrSelection};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::Zeroizing;

pub mod pcr;
#[cfg(feature = "tpm")]
mod tss;

#[cfg(feature = "tpm")]
pub use self::tss::{TssConnector, DEFAULT_TCTI};

/// Extended once the initramfs no longer needs the sealed keys.
pub const INITRAMFS_PCR: u8 = 12;

#[derive(Error, Debug)]
pub enum TpmError {
    #[error("no TPM2 device is available")]
    NoDevice,
    #[error("cannot read sealed key object {}: {source}", path.display())]
    ReadSealedKey { path: PathBuf, source: io::Error },
    #[error("invalid sealed key object {}: {source}", path.display())]
    InvalidSealedKey {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("failed to create auth session")]
    AuthSessionCreate,
    #[error("invalid persistent handle {0:#010x}")]
    InvalidHandle(u32),
    #[error(transparent)]
    Pcr(#[from] PcrError),
    #[cfg(feature = "tpm")]
    #[error(transparent)]
    TssEsapi(#[from] tss_esapi::Error),
}

pub type Result<T, E = TpmError> = core::result::Result<T, E>;

/// Where a key is sealed and the PCRs its policy is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKeyObject {
    pub handle: u32,
    pub pcrs: PcrSelection,
}

impl SealedKeyObject {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path).map_err(|source| TpmError::ReadSealedKey {
            path: path.to_owned(),
            source,
        })?;
        serde_yaml::from_slice(&raw).map_err(|source| TpmError::InvalidSealedKey {
            path: path.to_owned(),
            source,
        })
    }
}

pub trait TpmConnector {
    /// Fails with [`TpmError::NoDevice`] when there is no TPM to talk to.
    fn connect(&self) -> Result<Box<dyn TpmConnection>>;
}

pub trait TpmConnection {
    /// Whether the storage and endorsement hierarchies are enabled.
    fn is_enabled(&mut self) -> bool;
    fn unseal_key(&mut self, sealed_key_file: &Path) -> Result<Zeroizing<Vec<u8>>>;
    /// Extends `pcr` with random data so policies bound to it stop matching.
    fn block_pcr(&mut self, pcr: u8) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoTpm;

impl TpmConnector for NoTpm {
    fn connect(&self) -> Result<Box<dyn TpmConnection>> {
        Err(TpmError::NoDevice)
    }
}

#[cfg(test)]
mod tests {
    use super::pcr::PcrBank;
    use super::*;
    use eyre::Result;

    #[test]
    fn loads_sealed_key_object() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("ubuntu-data.sealed-key");
        fs::write(&path, "handle: 0x81000001\npcrs: sha256:7,12\n")?;
        let object = SealedKeyObject::load(&path)?;
        assert_eq!(object.handle, 0x8100_0001);
        assert_eq!(object.pcrs.bank, PcrBank::Sha256);
        assert_eq!(object.pcrs.slots, [7, 12]);
        Ok(())
    }

    #[test]
    fn bad_sealed_key_objects() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let missing = tmp.path().join("missing");
        assert!(matches!(
            SealedKeyObject::load(&missing),
            Err(TpmError::ReadSealedKey { .. })
        ));

        let garbage = tmp.path().join("garbage");
        fs::write(&garbage, "handle: 1\npcrs: md5:1\n")?;
        assert!(matches!(
            SealedKeyObject::load(&garbage),
            Err(TpmError::InvalidSealedKey { .. })
        ));
        Ok(())
    }

    #[test]
    fn no_tpm_has_no_device() {
        assert!(matches!(NoTpm.connect(), Err(TpmError::NoDevice)));
    }
}
