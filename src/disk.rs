//! Partition lookup on the boot disk and device-mapper plumbing.

use log::debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

const SECTOR_SIZE: u64 = 512;

#[derive(Error, Debug)]
pub enum DiskError {
    #[error("filesystem label {0:?} not found")]
    PartitionNotFound(String),
    #[error("cannot enumerate partitions in {}: {source}", dir.display())]
    Enumerate { dir: PathBuf, source: io::Error },
    #[error("cannot resolve {}: {source}", path.display())]
    Resolve { path: PathBuf, source: io::Error },
    #[error("cannot read size of {}: {reason}", device.display())]
    Size { device: PathBuf, reason: String },
    #[error("cannot create device mapping {name}: {output}")]
    Mapper { name: String, output: String },
    #[error("cannot run dmsetup: {0}")]
    Dmsetup(#[source] io::Error),
}

pub type Result<T, E = DiskError> = core::result::Result<T, E>;

impl DiskError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DiskError::PartitionNotFound(_))
    }
}

/// The disk the system booted from.
pub trait Disk {
    /// Partition UUID of the partition carrying filesystem label `label`.
    fn find_matching_partition_uuid_with_fs_label(&self, label: &str) -> Result<String>;
    /// Size of a partition device in bytes.
    fn partition_size(&self, device: &Path) -> Result<u64>;
}

/// Encodes a label the way udev names its `by-label` links.
pub fn udev_encode(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for b in label.bytes() {
        if b.is_ascii_alphanumeric() || b"#+-.:=@_".contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\x{b:02x}"));
        }
    }
    out
}

/// Reads the udev symlink trees under `/dev/disk` and block sizes from
/// `/sys/class/block`.
#[derive(Debug, Clone)]
pub struct UdevDisk {
    dev_root: PathBuf,
    sys_root: PathBuf,
}

impl Default for UdevDisk {
    fn default() -> Self {
        Self::new("/dev", "/sys")
    }
}

impl UdevDisk {
    pub fn new(dev_root: impl Into<PathBuf>, sys_root: impl Into<PathBuf>) -> Self {
        Self {
            dev_root: dev_root.into(),
            sys_root: sys_root.into(),
        }
    }

    fn resolve(path: &Path) -> Result<PathBuf> {
        fs::canonicalize(path).map_err(|source| DiskError::Resolve {
            path: path.to_owned(),
            source,
        })
    }
}

impl Disk for UdevDisk {
    fn find_matching_partition_uuid_with_fs_label(&self, label: &str) -> Result<String> {
        let link = self
            .dev_root
            .join("disk/by-label")
            .join(udev_encode(label));
        let device = match fs::canonicalize(&link) {
            Ok(device) => device,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(DiskError::PartitionNotFound(label.to_owned()))
            }
            Err(source) => return Err(DiskError::Resolve { path: link, source }),
        };

        let dir = self.dev_root.join("disk/by-partuuid");
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(DiskError::PartitionNotFound(label.to_owned()))
            }
            Err(source) => return Err(DiskError::Enumerate { dir, source }),
        };
        for entry in entries {
            let entry = entry.map_err(|source| DiskError::Enumerate {
                dir: dir.clone(),
                source,
            })?;
            if Self::resolve(&entry.path())? == device {
                let uuid = entry.file_name().to_string_lossy().into_owned();
                debug!("label {label:?} is partition {uuid} ({})", device.display());
                return Ok(uuid);
            }
        }
        Err(DiskError::PartitionNotFound(label.to_owned()))
    }

    fn partition_size(&self, device: &Path) -> Result<u64> {
        let size_err = |reason: String| DiskError::Size {
            device: device.to_owned(),
            reason,
        };
        let resolved = Self::resolve(device)?;
        let name = resolved
            .file_name()
            .ok_or_else(|| size_err("not a block device".into()))?;
        let size_file = self.sys_root.join("class/block").join(name).join("size");
        let sectors = fs::read_to_string(&size_file)
            .map_err(|e| size_err(e.to_string()))?
            .trim()
            .parse::<u64>()
            .map_err(|e| size_err(e.to_string()))?;
        Ok(sectors * SECTOR_SIZE)
    }
}

pub trait DeviceMapper {
    /// Maps `size` bytes of `source` starting at `offset` to
    /// `/dev/mapper/<name>` and returns that path.
    fn create_linear(
        &self,
        source: &Path,
        name: &str,
        uuid: &str,
        offset: u64,
        size: u64,
    ) -> Result<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct Dmsetup {
    program: PathBuf,
}

impl Default for Dmsetup {
    fn default() -> Self {
        Self::new("dmsetup")
    }
}

impl Dmsetup {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

pub fn linear_table(source: &Path, offset: u64, size: u64) -> String {
    format!(
        "0 {} linear {} {}",
        size / SECTOR_SIZE,
        source.display(),
        offset / SECTOR_SIZE
    )
}

impl DeviceMapper for Dmsetup {
    fn create_linear(
        &self,
        source: &Path,
        name: &str,
        uuid: &str,
        offset: u64,
        size: u64,
    ) -> Result<PathBuf> {
        let table = linear_table(source, offset, size);
        debug!("dmsetup create {name} --uuid {uuid} --table {table:?}");
        let output = Command::new(&self.program)
            .args(["create", name, "--uuid", uuid, "--table", &table])
            .output()
            .map_err(DiskError::Dmsetup)?;
        if !output.status.success() {
            return Err(DiskError::Mapper {
                name: name.to_owned(),
                output: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(Path::new("/dev/mapper").join(name))
    }
}
