//! Runs an fde hook under `systemd-run` and talks to it through files.
//!
//! The initrd systemd can only be reached over its private bus, so
//! `--pipe`/`--wait` are not available. Instead the hook's standard streams are
//! redirected to files in a private run directory and an `ExecStopPost`
//! action leaves a `<name>.success` or `<name>.failed` sentinel behind, which
//! is polled for.

use log::{debug, warn};
use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use zeroize::Zeroizing;

const STREAMS: [&str; 3] = ["stdin", "stdout", "stderr"];

#[derive(Error, Debug)]
pub enum HelperError {
    #[error("cannot create run directory {}: {source}", path.display())]
    RunDir { path: PathBuf, source: io::Error },
    #[error("cannot create {stream} for {name}: {source}")]
    Stream {
        name: String,
        stream: &'static str,
        source: io::Error,
    },
    #[error("cannot start {}: {source}", supervisor.display())]
    Spawn { supervisor: PathBuf, source: io::Error },
    #[error("{} failed ({status}): {output}", supervisor.display())]
    Supervisor {
        supervisor: PathBuf,
        status: ExitStatus,
        output: String,
    },
    #[error("{name} failed")]
    Failed { name: String, output: Vec<u8> },
    #[error("cannot read output of {name}: {source}")]
    Output { name: String, source: io::Error },
    #[error(
        "internal error: supervisor did not honor RuntimeMaxSec={}ms for {name}",
        runtime_max.as_millis()
    )]
    NotTerminated { name: String, runtime_max: Duration },
}

impl HelperError {
    /// What the hook printed on stderr plus the service result, if it failed.
    pub fn output(&self) -> Option<&[u8]> {
        match self {
            HelperError::Failed { output, .. } => Some(output),
            _ => None,
        }
    }
}

pub type Result<T, E = HelperError> = core::result::Result<T, E>;

/// How long a hook may run and how its completion is polled for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollTiming {
    pub runtime_max: Duration,
    /// 50ms polls at 20Hz, fast enough to not hold up boot without hogging
    /// the CPU from the hook.
    pub poll_interval: Duration,
    /// How many times `runtime_max` to keep polling before giving up on the
    /// supervisor.
    pub paranoia_factor: u32,
}

impl Default for PollTiming {
    fn default() -> Self {
        Self {
            runtime_max: Duration::from_secs(120),
            poll_interval: Duration::from_millis(50),
            paranoia_factor: 2,
        }
    }
}

impl PollTiming {
    pub fn max_polls(&self) -> u64 {
        let interval = self.poll_interval.as_nanos().max(1);
        let polls = (self.runtime_max.as_nanos() / interval) as u64;
        polls.saturating_mul(self.paranoia_factor as u64)
    }
}

/// Owns the run directory of one invocation and removes it on drop, the
/// stdout file may contain an unsealed key.
struct RunDir<'a> {
    path: &'a Path,
    name: &'a str,
}

impl<'a> RunDir<'a> {
    fn create(path: &'a Path, name: &'a str, stdin: &[u8]) -> Result<Self> {
        let run_dir_err = |source| HelperError::RunDir {
            path: path.to_path_buf(),
            source,
        };
        // a killed earlier invocation may have left sentinels or streams with
        // other permissions behind, none of it may be reused
        match fs::remove_dir_all(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(run_dir_err(e)),
            _ => {}
        }
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)
            .map_err(run_dir_err)?;
        let dir = RunDir { path, name };
        fs::set_permissions(path, Permissions::from_mode(0o700)).map_err(run_dir_err)?;

        for stream in STREAMS {
            let stream_err = |source| HelperError::Stream {
                name: name.to_owned(),
                stream,
                source,
            };
            let file = dir.file(stream);
            let mut f = OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&file)
                .map_err(stream_err)?;
            if stream == "stdin" {
                f.write_all(stdin).map_err(stream_err)?;
            }
        }
        Ok(dir)
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.path.join(format!("{}.{}", self.name, suffix))
    }
}

impl Drop for RunDir<'_> {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(self.path) {
            warn!("cannot remove run dir {}: {}", self.path.display(), e);
        }
    }
}

#[derive(Debug, Clone)]
pub struct HelperRunner {
    name: String,
    hook: PathBuf,
    run_dir: PathBuf,
    supervisor: PathBuf,
    supervisor_args: Vec<String>,
    timing: PollTiming,
}

impl HelperRunner {
    /// A runner for the hook `name`, using `<run_root>/<name>` as its run
    /// directory.
    pub fn new(name: &str, hook: impl Into<PathBuf>, run_root: &Path) -> Self {
        Self {
            name: name.to_owned(),
            hook: hook.into(),
            run_dir: run_root.join(name),
            supervisor: PathBuf::from("systemd-run"),
            supervisor_args: Vec::new(),
            timing: PollTiming::default(),
        }
    }

    /// Replaces `systemd-run`, `args` go before the properties.
    pub fn with_supervisor(mut self, supervisor: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.supervisor = supervisor.into();
        self.supervisor_args = args;
        self
    }

    pub fn with_timing(mut self, timing: PollTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn command(&self, dir: &RunDir) -> Command {
        let mut cmd = Command::new(&self.supervisor);
        cmd.args(&self.supervisor_args)
            .arg("--collect")
            .arg("--service-type=exec")
            .arg("--quiet")
            .arg(format!(
                "--property=RuntimeMaxSec={}ms",
                self.timing.runtime_max.as_millis()
            ))
            // hooks have no business mounting anything
            .arg("--property=SystemCallFilter=~@mount")
            .arg(format!(
                "--property=StandardInput=file:{}",
                dir.file("stdin").display()
            ))
            .arg(format!(
                "--property=StandardOutput=file:{}",
                dir.file("stdout").display()
            ))
            .arg(format!(
                "--property=StandardError=file:{}",
                dir.file("stderr").display()
            ))
            .arg(format!(
                r#"--property=ExecStopPost=/bin/sh -c 'if [ "$EXIT_STATUS" = 0 ]; then touch {}; else echo "service result: $SERVICE_RESULT" >{}; fi'"#,
                dir.file("success").display(),
                dir.file("failed").display()
            ))
            .arg(&self.hook);
        cmd
    }

    /// Runs the hook with `stdin` and returns what it wrote to stdout.
    pub fn run(&self, stdin: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let dir = RunDir::create(&self.run_dir, &self.name, stdin)?;

        debug!("running {} under {}", self.name, self.supervisor.display());
        let output = self
            .command(&dir)
            .output()
            .map_err(|source| HelperError::Spawn {
                supervisor: self.supervisor.clone(),
                source,
            })?;
        if !output.status.success() {
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            return Err(HelperError::Supervisor {
                supervisor: self.supervisor.clone(),
                status: output.status,
                output: String::from_utf8_lossy(&combined).trim().to_owned(),
            });
        }

        // the supervisor ends the hook after runtime_max, only poll longer
        // than that if it did not
        let (failed, success) = (dir.file("failed"), dir.file("success"));
        for _ in 0..self.timing.max_polls() {
            if failed.exists() {
                let mut output = fs::read(dir.file("stderr")).unwrap_or_default();
                output.extend(fs::read(&failed).unwrap_or_default());
                return Err(HelperError::Failed {
                    name: self.name.clone(),
                    output,
                });
            }
            if success.exists() {
                return fs::read(dir.file("stdout"))
                    .map(Zeroizing::new)
                    .map_err(|source| HelperError::Output {
                        name: self.name.clone(),
                        source,
                    });
            }
            thread::sleep(self.timing.poll_interval);
        }

        Err(HelperError::NotTerminated {
            name: self.name.clone(),
            runtime_max: self.timing.runtime_max,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fast_timing, mock_supervisor, write_script};
    use eyre::Result;
    use tempfile::TempDir;

    fn mode(path: &Path) -> Result<u32> {
        Ok(fs::metadata(path)?.permissions().mode() & 0o777)
    }

    #[test]
    fn max_polls_applies_paranoia_factor() {
        let timing = PollTiming::default();
        assert_eq!(timing.max_polls(), 2400 * 2);
    }

    #[test]
    fn returns_hook_stdout() -> Result<()> {
        let tmp = TempDir::new()?;
        let stdin_copy = tmp.path().join("hook-stdin");
        let hook = write_script(
            tmp.path(),
            "hook",
            &format!("cat > {}\nprintf unsealedkey", stdin_copy.display()),
        )?;
        let runner = HelperRunner::new("fde-reveal-key", hook, tmp.path())
            .with_supervisor(mock_supervisor(tmp.path())?, vec![])
            .with_timing(fast_timing());

        let output = runner.run(b"request")?;

        assert_eq!(output.as_slice(), b"unsealedkey");
        assert_eq!(fs::read(stdin_copy)?, b"request");
        assert!(!runner.run_dir().exists());
        Ok(())
    }

    #[test]
    fn passes_confinement_properties() -> Result<()> {
        let tmp = TempDir::new()?;
        let hook = write_script(tmp.path(), "hook", "true")?;
        let runner = HelperRunner::new("fde-reveal-key", hook, tmp.path())
            .with_supervisor(mock_supervisor(tmp.path())?, vec!["--user".to_string()])
            .with_timing(fast_timing());

        runner.run(b"")?;

        let args = fs::read_to_string(tmp.path().join("supervisor.args"))?;
        let args: Vec<_> = args.lines().collect();
        assert_eq!(args[0], "--user");
        assert!(args.contains(&"--property=SystemCallFilter=~@mount"));
        assert!(args.contains(&"--property=RuntimeMaxSec=1000ms"));
        Ok(())
    }

    #[test]
    fn failure_reports_stderr_and_service_result() -> Result<()> {
        let tmp = TempDir::new()?;
        let hook = write_script(
            tmp.path(),
            "hook",
            "echo output-only-used-for-errors >&2\nexit 1",
        )?;
        let runner = HelperRunner::new("fde-reveal-key", hook, tmp.path())
            .with_supervisor(mock_supervisor(tmp.path())?, vec![])
            .with_timing(fast_timing());

        let err = runner.run(b"").unwrap_err();

        assert_eq!(
            err.output(),
            Some(&b"output-only-used-for-errors\nservice result: exit-code\n"[..])
        );
        assert!(!runner.run_dir().exists());
        Ok(())
    }

    #[test]
    fn gives_up_when_supervisor_ignores_runtime_max() -> Result<()> {
        let tmp = TempDir::new()?;
        let lazy = write_script(tmp.path(), "lazy-supervisor", "exit 0")?;
        let runner = HelperRunner::new("fde-reveal-key", "/bin/true", tmp.path())
            .with_supervisor(lazy, vec![])
            .with_timing(fast_timing());

        let err = runner.run(b"").unwrap_err();

        assert!(matches!(err, HelperError::NotTerminated { .. }));
        assert_eq!(
            err.to_string(),
            "internal error: supervisor did not honor RuntimeMaxSec=1000ms for fde-reveal-key"
        );
        assert!(!runner.run_dir().exists());
        Ok(())
    }

    #[test]
    fn supervisor_failure_is_reported() -> Result<()> {
        let tmp = TempDir::new()?;
        let broken = write_script(tmp.path(), "broken-supervisor", "echo no bus >&2\nexit 3")?;
        let runner = HelperRunner::new("fde-reveal-key", "/bin/true", tmp.path())
            .with_supervisor(broken, vec![])
            .with_timing(fast_timing());

        let err = runner.run(b"").unwrap_err();

        assert!(matches!(err, HelperError::Supervisor { ref output, .. } if output == "no bus"));
        assert!(!runner.run_dir().exists());
        Ok(())
    }

    #[test]
    fn stream_files_are_recreated_private() -> Result<()> {
        let tmp = TempDir::new()?;
        let run_dir = tmp.path().join("fde-reveal-key");
        fs::create_dir(&run_dir)?;
        fs::set_permissions(&run_dir, Permissions::from_mode(0o755))?;
        for stream in STREAMS {
            let leftover = run_dir.join(format!("fde-reveal-key.{stream}"));
            fs::write(&leftover, b"leftover")?;
            fs::set_permissions(&leftover, Permissions::from_mode(0o644))?;
        }

        let dir = RunDir::create(&run_dir, "fde-reveal-key", b"in")?;

        assert_eq!(mode(&run_dir)?, 0o700);
        for stream in STREAMS {
            assert_eq!(mode(&dir.file(stream))?, 0o600);
        }
        assert_eq!(fs::read(dir.file("stdin"))?, b"in");
        assert_eq!(fs::read(dir.file("stdout"))?, b"");
        drop(dir);
        assert!(!run_dir.exists());
        Ok(())
    }

    #[test]
    fn leftover_sentinels_are_not_trusted() -> Result<()> {
        let tmp = TempDir::new()?;
        let run_dir = tmp.path().join("fde-reveal-key");
        fs::create_dir(&run_dir)?;
        fs::write(run_dir.join("fde-reveal-key.success"), b"")?;
        fs::write(run_dir.join("fde-reveal-key.stdout"), b"stale key")?;
        let lazy = write_script(tmp.path(), "lazy-supervisor", "exit 0")?;
        let runner = HelperRunner::new("fde-reveal-key", "/bin/true", tmp.path())
            .with_supervisor(lazy, vec![])
            .with_timing(fast_timing());

        let err = runner.run(b"").unwrap_err();

        assert!(matches!(err, HelperError::NotTerminated { .. }));
        assert!(!run_dir.exists());

        fs::create_dir(&run_dir)?;
        fs::write(run_dir.join("fde-reveal-key.failed"), b"exit-code")?;
        let dir = RunDir::create(&run_dir, "fde-reveal-key", b"")?;
        assert!(!dir.file("failed").exists());
        assert!(!dir.file("success").exists());
        Ok(())
    }
}
