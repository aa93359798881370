//! Unlocking of named volumes on the boot disk.
//!
//! A volume `<name>` is encrypted when the disk carries a partition labelled
//! `<name>-enc`; otherwise the plain `<name>` partition is used as is. How an
//! encrypted volume is opened depends on what the platform ships, see
//! [`UnlockMechanism`].

use crate::disk::{DeviceMapper, Disk, DiskError, Dmsetup, UdevDisk};
use crate::fde::{
    find_hook, DeviceUnlockRequest, FdeError, FdeHooks, RevealKeyRequest, DEVICE_UNLOCK_HOOK,
    REVEAL_KEY_HOOK,
};
use crate::luks::{LuksError, VolumeActivator};
use crate::recovery::{AskPassword, RecoveryError, RecoveryKey, RecoveryKeyPrompt};
use crate::tpm::{TpmConnection, TpmConnector, TpmError, INITRAMFS_PCR};
use log::{debug, info, warn};
use serde::Serialize;
use std::cell::Cell;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroizing;

pub const DEFAULT_RECOVERY_KEY_TRIES: u32 = 3;
/// Reserved header in front of the data of volumes opened by
/// `fde-device-unlock`.
pub const DEVICE_UNLOCK_OFFSET: u64 = 16 << 20;

const BY_PARTUUID_DIR: &str = "/dev/disk/by-partuuid";
const MAPPER_DIR: &str = "/dev/mapper";

#[derive(Error, Debug)]
pub enum UnlockError {
    #[error("error enumerating partitions for disk to find {kind} device {name:?}: {source}")]
    Locate {
        name: String,
        kind: &'static str,
        source: DiskError,
    },
    #[error(transparent)]
    Disk(#[from] DiskError),
    #[error("cannot read sealed key file {}: {source}", path.display())]
    SealedKeyFile { path: PathBuf, source: io::Error },
    #[error("partition of {size} bytes has no room after the reserved header")]
    PartitionTooSmall { size: u64 },
    #[error(transparent)]
    Hook(#[from] FdeError),
    #[error(transparent)]
    Tpm(#[from] TpmError),
    #[error(transparent)]
    Activate(#[from] LuksError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error("no usable TPM and recovery key not allowed")]
    TpmUnavailable,
    #[error("no recovery key attempts left")]
    NoRecoveryAttempts,
    #[error("recovery key rejected after {attempts} attempts: {source}")]
    RecoveryKeyRejected {
        attempts: u32,
        source: Box<UnlockError>,
    },
}

pub type Result<T, E = UnlockError> = core::result::Result<T, E>;

#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum UnlockMethod {
    #[default]
    NotUnlocked,
    UnlockedWithKey,
    UnlockedWithSealedKey,
    UnlockedWithRecoveryKey,
}

/// Outcome of one unlock attempt.
///
/// `is_encrypted` is set as soon as the encrypted partition was found, so a
/// failed attempt still tells the caller which kind of volume it dealt with.
#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct UnlockResult {
    pub is_encrypted: bool,
    pub partition_device: Option<PathBuf>,
    pub filesystem_device: Option<PathBuf>,
    pub unlock_method: UnlockMethod,
}

#[derive(Error, Debug)]
#[error("cannot unlock volume {name:?}{}: {source}", on_device(.result))]
pub struct UnlockFailure {
    pub name: String,
    pub result: UnlockResult,
    #[source]
    pub source: UnlockError,
}

fn on_device(result: &UnlockResult) -> String {
    result
        .partition_device
        .as_ref()
        .map(|device| format!(" on {}", device.display()))
        .unwrap_or_default()
}

/// How recovery key attempts are counted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKeyScope {
    /// Every unlock call may use all attempts.
    #[default]
    PerCall,
    /// All unlock calls of one [`Unlocker`] share the attempts.
    PerBootSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlockOptions {
    pub allow_recovery_key: bool,
    pub recovery_key_tries: u32,
    /// Block the sealed keys once this volume is handled. Set on the last
    /// volume only.
    pub lock_keys_on_finish: bool,
    pub recovery_scope: RecoveryKeyScope,
}

impl Default for UnlockOptions {
    fn default() -> Self {
        Self {
            allow_recovery_key: false,
            recovery_key_tries: DEFAULT_RECOVERY_KEY_TRIES,
            lock_keys_on_finish: false,
            recovery_scope: RecoveryKeyScope::PerCall,
        }
    }
}

/// What the platform unlocks encrypted volumes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockMechanism {
    DeviceUnlockHook,
    RevealKeyHook,
    Tpm,
}

impl UnlockMechanism {
    pub fn detect(hook_dir: Option<&Path>) -> Self {
        let mechanism = if find_hook(DEVICE_UNLOCK_HOOK, hook_dir).is_some() {
            UnlockMechanism::DeviceUnlockHook
        } else if find_hook(REVEAL_KEY_HOOK, hook_dir).is_some() {
            UnlockMechanism::RevealKeyHook
        } else {
            UnlockMechanism::Tpm
        };
        debug!("unlock mechanism: {mechanism:?}");
        mechanism
    }
}

pub fn random_kernel_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// Everything the unlocker talks to.
pub struct Platform {
    pub disk: Box<dyn Disk>,
    pub mapper: Box<dyn DeviceMapper>,
    pub tpm: Box<dyn TpmConnector>,
    pub activator: Box<dyn VolumeActivator>,
    pub hooks: Box<dyn FdeHooks>,
    pub prompt: Box<dyn RecoveryKeyPrompt>,
    pub mapper_suffix: fn() -> String,
}

impl Platform {
    /// The running system: udev, dmsetup, systemd-ask-password and the
    /// activator and TPM connector the build was configured with.
    pub fn system(hooks: Box<dyn FdeHooks>) -> Self {
        Self {
            disk: Box::new(UdevDisk::default()),
            mapper: Box::new(Dmsetup::default()),
            tpm: default_tpm(),
            activator: default_activator(),
            hooks,
            prompt: Box::new(AskPassword::default()),
            mapper_suffix: random_kernel_uuid,
        }
    }
}

#[cfg(feature = "tpm")]
fn default_tpm() -> Box<dyn TpmConnector> {
    Box::new(crate::tpm::TssConnector::default())
}

#[cfg(not(feature = "tpm"))]
fn default_tpm() -> Box<dyn TpmConnector> {
    Box::new(crate::tpm::NoTpm)
}

#[cfg(feature = "libcryptsetup")]
fn default_activator() -> Box<dyn VolumeActivator> {
    Box::new(crate::luks::LibCryptsetup)
}

#[cfg(not(feature = "libcryptsetup"))]
fn default_activator() -> Box<dyn VolumeActivator> {
    Box::new(crate::luks::Cryptsetup::default())
}

pub struct Unlocker {
    platform: Platform,
    mechanism: UnlockMechanism,
    recovery_attempts: Cell<u32>,
}

impl Unlocker {
    pub fn new(platform: Platform, mechanism: UnlockMechanism) -> Self {
        Self {
            platform,
            mechanism,
            recovery_attempts: Cell::new(0),
        }
    }

    pub fn mechanism(&self) -> UnlockMechanism {
        self.mechanism
    }

    /// Unlocks volume `name` if it is encrypted, using the key sealed in
    /// `sealed_key_file`.
    pub fn unlock_volume_if_encrypted(
        &self,
        name: &str,
        sealed_key_file: &Path,
        options: &UnlockOptions,
    ) -> Result<UnlockResult, UnlockFailure> {
        let mut result = UnlockResult::default();
        let outcome = self.try_unlock_if_encrypted(name, sealed_key_file, options, &mut result);
        finish(name, result, outcome)
    }

    /// Unlocks the encrypted volume `name` with a key the caller already has.
    pub fn unlock_volume_with_key(
        &self,
        name: &str,
        key: &[u8],
    ) -> Result<UnlockResult, UnlockFailure> {
        let mut result = UnlockResult::default();
        let outcome = self.try_unlock_with_key(name, key, &mut result);
        finish(name, result, outcome)
    }

    /// Makes the sealed keys unusable until the next boot.
    pub fn lock_sealed_keys(&self) -> Result<()> {
        match self.mechanism {
            UnlockMechanism::DeviceUnlockHook | UnlockMechanism::RevealKeyHook => {
                self.platform.hooks.reveal_key(&RevealKeyRequest::lock())?;
            }
            UnlockMechanism::Tpm => match self.platform.tpm.connect() {
                Ok(mut tpm) => tpm.block_pcr(INITRAMFS_PCR)?,
                Err(TpmError::NoDevice) => warn!("cannot open TPM connection: no TPM2 device"),
                Err(e) => return Err(e.into()),
            },
        }
        info!("sealed keys locked");
        Ok(())
    }

    fn try_unlock_if_encrypted(
        &self,
        name: &str,
        sealed_key_file: &Path,
        options: &UnlockOptions,
        result: &mut UnlockResult,
    ) -> Result<()> {
        let disk = &self.platform.disk;
        let locate_err = |kind, source| UnlockError::Locate {
            name: name.to_owned(),
            kind,
            source,
        };
        let part_uuid = match disk.find_matching_partition_uuid_with_fs_label(&format!("{name}-enc"))
        {
            Ok(uuid) => {
                result.is_encrypted = true;
                uuid
            }
            Err(e) if e.is_not_found() => disk
                .find_matching_partition_uuid_with_fs_label(name)
                .map_err(|e| locate_err("unencrypted", e))?,
            Err(e) => return Err(locate_err("encrypted", e)),
        };
        let part_device = Path::new(BY_PARTUUID_DIR).join(&part_uuid);
        result.partition_device = Some(part_device.clone());

        if !result.is_encrypted {
            debug!("{name} is not encrypted");
            result.filesystem_device = Some(part_device);
            return Ok(());
        }

        let mapper_name = format!("{name}-{}", (self.platform.mapper_suffix)());
        let target = Path::new(MAPPER_DIR).join(&mapper_name);
        match self.mechanism {
            UnlockMechanism::DeviceUnlockHook => {
                let fs_device =
                    self.unlock_with_device_hook(name, &part_uuid, &part_device, sealed_key_file)?;
                result.filesystem_device = Some(fs_device);
                result.unlock_method = UnlockMethod::UnlockedWithSealedKey;
            }
            UnlockMechanism::RevealKeyHook => {
                let revealed = self.reveal(name, sealed_key_file).and_then(|key| {
                    self.platform
                        .activator
                        .activate_with_key(&mapper_name, &part_device, &key)?;
                    info!("activated {} with revealed key", part_device.display());
                    Ok(())
                });
                result.unlock_method = match revealed {
                    Ok(()) => UnlockMethod::UnlockedWithSealedKey,
                    Err(e) if options.allow_recovery_key => {
                        warn!("cannot activate {} with revealed key: {e}", part_device.display());
                        self.unlock_with_recovery_key(name, &mapper_name, &part_device, options)?
                    }
                    Err(e) => return Err(e),
                };
                result.filesystem_device = Some(target);
            }
            UnlockMechanism::Tpm => {
                let method = self.unlock_with_tpm(
                    name,
                    &mapper_name,
                    &part_device,
                    sealed_key_file,
                    options,
                )?;
                result.filesystem_device = Some(target);
                result.unlock_method = method;
            }
        }
        Ok(())
    }

    fn try_unlock_with_key(&self, name: &str, key: &[u8], result: &mut UnlockResult) -> Result<()> {
        let part_uuid = self
            .platform
            .disk
            .find_matching_partition_uuid_with_fs_label(&format!("{name}-enc"))?;
        result.is_encrypted = true;
        let part_device = Path::new(BY_PARTUUID_DIR).join(part_uuid);
        result.partition_device = Some(part_device.clone());

        let mapper_name = format!("{name}-{}", (self.platform.mapper_suffix)());
        self.platform
            .activator
            .activate_with_key(&mapper_name, &part_device, key)?;
        info!("activated {} with key", part_device.display());
        result.filesystem_device = Some(Path::new(MAPPER_DIR).join(mapper_name));
        result.unlock_method = UnlockMethod::UnlockedWithKey;
        Ok(())
    }

    fn reveal(&self, name: &str, sealed_key_file: &Path) -> Result<Zeroizing<Vec<u8>>> {
        let sealed_key = fs::read(sealed_key_file).map_err(|source| UnlockError::SealedKeyFile {
            path: sealed_key_file.to_owned(),
            source,
        })?;
        let request = RevealKeyRequest::for_sealed_key_file(sealed_key, name)?;
        Ok(self.platform.hooks.reveal_key(&request)?)
    }

    /// Maps the partition past its reserved header and hands it to
    /// `fde-device-unlock`, which creates `/dev/mapper/<name>`.
    fn unlock_with_device_hook(
        &self,
        name: &str,
        part_uuid: &str,
        part_device: &Path,
        sealed_key_file: &Path,
    ) -> Result<PathBuf> {
        let size = self.platform.disk.partition_size(part_device)?;
        let mapped_size = size
            .checked_sub(DEVICE_UNLOCK_OFFSET)
            .filter(|s| *s > 0)
            .ok_or(UnlockError::PartitionTooSmall { size })?;
        let locked_name = format!("{name}-device-locked");
        let dm_uuid = format!("CRYPT-LUKS2-{}-{locked_name}", part_uuid.replace('-', ""));
        let locked = self.platform.mapper.create_linear(
            part_device,
            &locked_name,
            &dm_uuid,
            DEVICE_UNLOCK_OFFSET,
            mapped_size,
        )?;

        let key = self.reveal(name, sealed_key_file)?;
        self.platform
            .hooks
            .device_unlock(&DeviceUnlockRequest::new(key.to_vec(), &locked, name))?;
        info!("unlocked {} through {DEVICE_UNLOCK_HOOK}", locked.display());
        Ok(Path::new(MAPPER_DIR).join(name))
    }

    fn unlock_with_tpm(
        &self,
        name: &str,
        mapper_name: &str,
        device: &Path,
        sealed_key_file: &Path,
        options: &UnlockOptions,
    ) -> Result<UnlockMethod> {
        let mut tpm = match self.platform.tpm.connect() {
            Ok(tpm) => Some(tpm),
            Err(TpmError::NoDevice) => {
                warn!("cannot open TPM connection: no TPM2 device");
                None
            }
            Err(e) => return Err(e.into()),
        };
        // firmware may hide the hierarchies while the device stays visible
        let enabled = tpm.as_deref_mut().map_or(false, |tpm| tpm.is_enabled());
        if tpm.is_some() && !enabled {
            warn!("TPM device detected but not enabled");
        }

        let outcome = match tpm.as_deref_mut().filter(|_| enabled) {
            Some(tpm) => match self.activate_with_sealed_key(tpm, mapper_name, device, sealed_key_file)
            {
                Ok(()) => Ok(UnlockMethod::UnlockedWithSealedKey),
                Err(e) if options.allow_recovery_key => {
                    warn!("cannot activate {} with sealed key: {e}", device.display());
                    self.unlock_with_recovery_key(name, mapper_name, device, options)
                }
                Err(e) => Err(e),
            },
            None if options.allow_recovery_key => {
                self.unlock_with_recovery_key(name, mapper_name, device, options)
            }
            None => Err(UnlockError::TpmUnavailable),
        };

        if options.lock_keys_on_finish {
            if let Some(tpm) = tpm.as_deref_mut().filter(|_| enabled) {
                match tpm.block_pcr(INITRAMFS_PCR) {
                    Ok(()) => info!("sealed keys locked"),
                    Err(e) if outcome.is_ok() => return Err(e.into()),
                    Err(e) => warn!("cannot lock sealed keys: {e}"),
                }
            }
        }
        outcome
    }

    fn activate_with_sealed_key(
        &self,
        tpm: &mut dyn TpmConnection,
        mapper_name: &str,
        device: &Path,
        sealed_key_file: &Path,
    ) -> Result<()> {
        let key = tpm.unseal_key(sealed_key_file)?;
        self.platform
            .activator
            .activate_with_key(mapper_name, device, &key)?;
        info!("activated {} with TPM", device.display());
        Ok(())
    }

    fn unlock_with_recovery_key(
        &self,
        name: &str,
        mapper_name: &str,
        device: &Path,
        options: &UnlockOptions,
    ) -> Result<UnlockMethod> {
        let allowed = match options.recovery_scope {
            RecoveryKeyScope::PerCall => options.recovery_key_tries,
            RecoveryKeyScope::PerBootSession => options
                .recovery_key_tries
                .saturating_sub(self.recovery_attempts.get()),
        };
        if allowed == 0 {
            return Err(UnlockError::NoRecoveryAttempts);
        }

        let mut attempt = 1;
        loop {
            self.recovery_attempts.set(self.recovery_attempts.get() + 1);
            match self.try_recovery_key(name, mapper_name, device) {
                Ok(()) => {
                    info!("activated {} with recovery key", device.display());
                    return Ok(UnlockMethod::UnlockedWithRecoveryKey);
                }
                Err(UnlockError::Recovery(e @ RecoveryError::Spawn { .. })) => return Err(e.into()),
                Err(e) if attempt < allowed => {
                    warn!("recovery key attempt {attempt} of {allowed} failed: {e}");
                    attempt += 1;
                }
                Err(e) => {
                    return Err(UnlockError::RecoveryKeyRejected {
                        attempts: attempt,
                        source: Box::new(e),
                    })
                }
            }
        }
    }

    fn try_recovery_key(&self, name: &str, mapper_name: &str, device: &Path) -> Result<()> {
        let answer = self.platform.prompt.prompt(name, device)?;
        let key: RecoveryKey = answer.parse()?;
        self.platform
            .activator
            .activate_with_key(mapper_name, device, key.as_bytes())?;
        Ok(())
    }
}

fn finish(
    name: &str,
    result: UnlockResult,
    outcome: Result<()>,
) -> Result<UnlockResult, UnlockFailure> {
    match outcome {
        Ok(()) => Ok(result),
        Err(source) => Err(UnlockFailure {
            name: name.to_owned(),
            result,
            source,
        }),
    }
}
