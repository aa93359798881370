//! Doubles shared by the unit tests.

use crate::fde::runner::PollTiming;
use eyre::Result;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub fn write_script(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

/// Stands in for `systemd-run`: runs the hook with the redirections and the
/// `ExecStopPost` action it is given, and records its arguments.
pub fn mock_supervisor(dir: &Path) -> Result<PathBuf> {
    write_script(
        dir,
        "systemd-run",
        r#"printf '%s\n' "$@" > "$(dirname "$0")/supervisor.args"
for arg in "$@"; do
    case "$arg" in
        --property=StandardInput=file:*) stdin="${arg#--property=StandardInput=file:}" ;;
        --property=StandardOutput=file:*) stdout="${arg#--property=StandardOutput=file:}" ;;
        --property=StandardError=file:*) stderr="${arg#--property=StandardError=file:}" ;;
        --property=ExecStopPost=*) stop_post="${arg#--property=ExecStopPost=}" ;;
        -*) ;;
        *) hook="$arg" ;;
    esac
done
"$hook" <"$stdin" >"$stdout" 2>"$stderr"
EXIT_STATUS=$?
if [ "$EXIT_STATUS" = 0 ]; then SERVICE_RESULT=success; else SERVICE_RESULT=exit-code; fi
export EXIT_STATUS SERVICE_RESULT
eval "$stop_post""#,
    )
}

pub fn fast_timing() -> PollTiming {
    PollTiming {
        runtime_max: Duration::from_secs(1),
        poll_interval: Duration::from_millis(10),
        paranoia_factor: 2,
    }
}
