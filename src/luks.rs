//! LUKS volume activation.

use log::debug;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LuksError {
    #[error("cannot run {}: {source}", program.display())]
    Spawn { program: PathBuf, source: io::Error },
    #[error("cannot activate {name} from {}: {output}", device.display())]
    Activate {
        name: String,
        device: PathBuf,
        output: String,
    },
    #[cfg(feature = "libcryptsetup")]
    #[error(transparent)]
    CryptSetup(#[from] cryptsetup_rs::Error),
}

pub type Result<T, E = LuksError> = core::result::Result<T, E>;

pub trait VolumeActivator {
    /// Opens the LUKS volume on `device` as `/dev/mapper/<name>`.
    fn activate_with_key(&self, name: &str, device: &Path, key: &[u8]) -> Result<()>;
}

/// Activates through the `cryptsetup` tool, passing the key on stdin.
#[derive(Debug, Clone)]
pub struct Cryptsetup {
    program: PathBuf,
}

impl Default for Cryptsetup {
    fn default() -> Self {
        Self::new("cryptsetup")
    }
}

impl Cryptsetup {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl VolumeActivator for Cryptsetup {
    fn activate_with_key(&self, name: &str, device: &Path, key: &[u8]) -> Result<()> {
        debug!("activating {name} from {}", device.display());
        let spawn_err = |source| LuksError::Spawn {
            program: self.program.clone(),
            source,
        };
        let mut child = Command::new(&self.program)
            .args(["open", "--type", "luks", "--key-file=-"])
            .arg(device)
            .arg(name)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;
        if let Some(mut stdin) = child.stdin.take() {
            // a broken pipe shows up as a failed exit below
            if let Err(e) = stdin.write_all(key) {
                debug!("cannot pass key to {}: {e}", self.program.display());
            }
        }
        let output = child.wait_with_output().map_err(spawn_err)?;
        if !output.status.success() {
            return Err(LuksError::Activate {
                name: name.to_owned(),
                device: device.to_owned(),
                output: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(())
    }
}

/// Activates through libcryptsetup.
#[cfg(feature = "libcryptsetup")]
#[derive(Debug, Default, Clone, Copy)]
pub struct LibCryptsetup;

#[cfg(feature = "libcryptsetup")]
impl VolumeActivator for LibCryptsetup {
    fn activate_with_key(&self, name: &str, device: &Path, key: &[u8]) -> Result<()> {
        use cryptsetup_rs::api::LuksCryptDevice;
        use either::Either;

        let keyslot = match cryptsetup_rs::open(device)?.luks()? {
            Either::Left(mut luks1) => luks1.activate(name, key)?,
            Either::Right(mut luks2) => luks2.activate(name, key)?,
        };
        debug!("activated {name} with keyslot {keyslot}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_script;
    use eyre::Result;
    use std::fs;

    #[test]
    fn passes_key_on_stdin() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let program = write_script(
            tmp.path(),
            "cryptsetup",
            r#"dir="$(dirname "$0")"
echo "$@" > "$dir/args"
cat > "$dir/key""#,
        )?;
        Cryptsetup::new(program).activate_with_key(
            "ubuntu-data-1234",
            Path::new("/dev/disk/by-partuuid/1234"),
            b"secret",
        )?;
        assert_eq!(
            fs::read_to_string(tmp.path().join("args"))?,
            "open --type luks --key-file=- /dev/disk/by-partuuid/1234 ubuntu-data-1234\n"
        );
        assert_eq!(fs::read(tmp.path().join("key"))?, b"secret");
        Ok(())
    }

    #[test]
    fn reports_cryptsetup_failure() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let program = write_script(
            tmp.path(),
            "cryptsetup",
            "cat >/dev/null; echo 'No key available with this passphrase.' >&2; exit 2",
        )?;
        let err = Cryptsetup::new(program)
            .activate_with_key("data", Path::new("/dev/vda4"), b"wrong")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot activate data from /dev/vda4: No key available with this passphrase."
        );
        Ok(())
    }
}
