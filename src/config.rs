//! Settings read from `/etc/fde-unlock.yaml`.

use crate::fde::runner::PollTiming;
use crate::fde::SystemdHooks;
use crate::kdf::coordinator::{DEFAULT_DEADLINE, DEFAULT_TIMEOUT};
use crate::kdf::worker::DEFAULT_LOCK_FILE;
use crate::kdf::{OutOfProcessKdf, WatchdogMonitor};
use crate::unlock::DEFAULT_RECOVERY_KEY_TRIES;
use log::debug;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/fde-unlock.yaml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid config {}: {key} must not be zero", path.display())]
    Zero { path: PathBuf, key: &'static str },
    #[error("supervisor command is empty")]
    EmptySupervisor,
}

pub type Result<T, E = ConfigError> = core::result::Result<T, E>;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Config {
    /// Hook run directories are created below this.
    pub run_dir: PathBuf,
    /// Where to look for hooks instead of `PATH`.
    pub hook_dir: Option<PathBuf>,
    /// Command the hooks run under, e.g. `["systemd-run", "--user"]`.
    pub supervisor: Vec<String>,
    pub helper: HelperConfig,
    pub recovery_key_tries: u32,
    pub argon2: Argon2Config,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct HelperConfig {
    pub runtime_max_secs: u64,
    pub poll_interval_ms: u64,
    pub paranoia_factor: u32,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Argon2Config {
    pub timeout_ms: u64,
    pub deadline_secs: u64,
    /// Watchdog requests are only sent when set.
    pub watchdog_period_ms: Option<u64>,
    pub lock_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from("/run"),
            hook_dir: None,
            supervisor: vec!["systemd-run".to_owned()],
            helper: HelperConfig::default(),
            recovery_key_tries: DEFAULT_RECOVERY_KEY_TRIES,
            argon2: Argon2Config::default(),
        }
    }
}

impl Default for HelperConfig {
    fn default() -> Self {
        let timing = PollTiming::default();
        Self {
            runtime_max_secs: timing.runtime_max.as_secs(),
            poll_interval_ms: timing.poll_interval.as_millis() as u64,
            paranoia_factor: timing.paranoia_factor,
        }
    }
}

impl Default for Argon2Config {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            deadline_secs: DEFAULT_DEADLINE.as_secs(),
            watchdog_period_ms: None,
            lock_file: PathBuf::from(DEFAULT_LOCK_FILE),
        }
    }
}

impl Config {
    /// Reads `path`, a missing file gives the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_owned(),
                    source,
                })
            }
        };
        let config = Self::parse(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        match config.zero_setting() {
            Some(key) => Err(ConfigError::Zero {
                path: path.to_owned(),
                key,
            }),
            None => Ok(config),
        }
    }

    /// A zero runtime makes systemd drop the limit and a zero interval
    /// busy-polls, neither is a usable setting.
    fn zero_setting(&self) -> Option<&'static str> {
        let settings = [
            ("helper.runtime-max-secs", self.helper.runtime_max_secs),
            ("helper.poll-interval-ms", self.helper.poll_interval_ms),
            ("helper.paranoia-factor", self.helper.paranoia_factor.into()),
            ("argon2.timeout-ms", self.argon2.timeout_ms),
            ("argon2.deadline-secs", self.argon2.deadline_secs),
            (
                "argon2.watchdog-period-ms",
                self.argon2.watchdog_period_ms.unwrap_or(1),
            ),
        ];
        settings
            .into_iter()
            .find(|(_, value)| *value == 0)
            .map(|(key, _)| key)
    }

    fn parse(raw: &[u8]) -> Result<Self, serde_yaml::Error> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_yaml::from_slice(raw)
    }

    pub fn hooks(&self) -> Result<SystemdHooks> {
        let (supervisor, args) = self
            .supervisor
            .split_first()
            .ok_or(ConfigError::EmptySupervisor)?;
        Ok(SystemdHooks::new(self.hook_dir.as_deref(), &self.run_dir)
            .with_supervisor(Path::new(supervisor), args.to_vec())
            .with_timing(self.helper.timing()))
    }
}

impl HelperConfig {
    pub fn timing(&self) -> PollTiming {
        PollTiming {
            runtime_max: Duration::from_secs(self.runtime_max_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            paranoia_factor: self.paranoia_factor,
        }
    }
}

impl Argon2Config {
    /// Applies these settings to a worker based KDF.
    pub fn configure(&self, kdf: OutOfProcessKdf) -> OutOfProcessKdf {
        let kdf = kdf
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_deadline(Duration::from_secs(self.deadline_secs))
            .with_lock_file(&self.lock_file);
        match self.watchdog_period_ms {
            Some(ms) => {
                let period = Duration::from_millis(ms);
                kdf.with_watchdog(WatchdogMonitor {
                    period,
                    response_timeout: period,
                })
            }
            None => kdf,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn missing_file_gives_defaults() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let config = Config::load(&tmp.path().join("fde-unlock.yaml"))?;
        assert_eq!(config, Config::default());
        assert_eq!(config.helper.timing(), PollTiming::default());
        assert_eq!(config.recovery_key_tries, 3);
        assert_eq!(config.argon2.lock_file, Path::new("/run/fde-unlock/argon2.lock"));
        Ok(())
    }

    #[test]
    fn empty_file_gives_defaults() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("fde-unlock.yaml");
        fs::write(&path, "\n")?;
        assert_eq!(Config::load(&path)?, Config::default());
        Ok(())
    }

    #[test]
    fn reads_partial_config() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("fde-unlock.yaml");
        fs::write(
            &path,
            r#"
hook-dir: /usr/lib/fde
supervisor: [systemd-run, --user]
helper:
  runtime-max-secs: 30
recovery-key-tries: 5
argon2:
  watchdog-period-ms: 500
"#,
        )?;
        let config = Config::load(&path)?;
        assert_eq!(config.hook_dir.as_deref(), Some(Path::new("/usr/lib/fde")));
        assert_eq!(config.supervisor, ["systemd-run", "--user"]);
        assert_eq!(config.run_dir, Path::new("/run"));
        assert_eq!(
            config.helper.timing(),
            PollTiming {
                runtime_max: Duration::from_secs(30),
                ..PollTiming::default()
            }
        );
        assert_eq!(config.recovery_key_tries, 5);
        assert_eq!(config.argon2.watchdog_period_ms, Some(500));
        assert_eq!(config.argon2.deadline_secs, 300);
        Ok(())
    }

    #[test]
    fn rejects_unknown_keys() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("fde-unlock.yaml");
        fs::write(&path, "recovery-key-retries: 5\n")?;
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("recovery-key-retries"));
        Ok(())
    }

    #[test]
    fn rejects_zero_timings() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("fde-unlock.yaml");
        for (yaml, key) in [
            ("helper:\n  runtime-max-secs: 0\n", "helper.runtime-max-secs"),
            ("helper:\n  poll-interval-ms: 0\n", "helper.poll-interval-ms"),
            ("helper:\n  paranoia-factor: 0\n", "helper.paranoia-factor"),
            ("argon2:\n  watchdog-period-ms: 0\n", "argon2.watchdog-period-ms"),
        ] {
            fs::write(&path, yaml)?;
            let err = Config::load(&path).unwrap_err();
            assert!(matches!(err, ConfigError::Zero { key: k, .. } if k == key), "{err}");
            assert!(err.to_string().ends_with(&format!("{key} must not be zero")));
        }

        fs::write(&path, "helper:\n  runtime-max-secs: 1\n  poll-interval-ms: 1\n")?;
        assert_eq!(Config::load(&path)?.helper.timing().max_polls(), 2000);
        Ok(())
    }

    #[test]
    fn empty_supervisor() {
        let config = Config {
            supervisor: Vec::new(),
            ..Config::default()
        };
        assert!(matches!(config.hooks(), Err(ConfigError::EmptySupervisor)));
    }
}
