use eyre::Result;
use fde_unlock::kdf::worker::LOCK_FILE_ENV;
use fde_unlock::kdf::{
    Argon2Kdf, Argon2Mode, DeriveJob, InProcessKdf, KdfError, OutOfProcessKdf, WatchdogMonitor,
    WORKER_ARG,
};
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Duration;
use tempfile::TempDir;

const EXE: &str = env!("CARGO_BIN_EXE_fde-unlock");

fn job() -> DeriveJob {
    DeriveJob {
        mode: Argon2Mode::Argon2id,
        passphrase: b"correct horse battery staple".to_vec(),
        salt: b"0123456789abcdef".to_vec(),
        time_cost: 2,
        memory_kib: 1024,
        threads: 1,
        key_len: 32,
    }
}

fn worker(tmp: &TempDir) -> OutOfProcessKdf {
    OutOfProcessKdf::new(EXE)
        .with_deadline(Duration::from_secs(60))
        .with_lock_file(tmp.path().join("argon2.lock"))
}

#[test]
fn worker_matches_in_process_derivation() -> Result<()> {
    let tmp = TempDir::new()?;
    let expected = InProcessKdf.derive(&job())?;
    let key = worker(&tmp).derive(&job())?;
    assert_eq!(key.as_slice(), expected.as_slice());
    assert!(tmp.path().join("argon2.lock").exists());
    Ok(())
}

#[test]
fn worker_answers_watchdog() -> Result<()> {
    let tmp = TempDir::new()?;
    let mut heavy = job();
    heavy.time_cost = 4;
    heavy.memory_kib = 16 * 1024;
    let expected = InProcessKdf.derive(&heavy)?;
    let key = worker(&tmp)
        .with_watchdog(WatchdogMonitor {
            period: Duration::from_millis(1),
            response_timeout: Duration::from_secs(10),
        })
        .derive(&heavy)?;
    assert_eq!(key.as_slice(), expected.as_slice());
    Ok(())
}

#[test]
fn worker_reports_invalid_parameters() -> Result<()> {
    let tmp = TempDir::new()?;
    let mut invalid = job();
    invalid.key_len = 0;
    match worker(&tmp).derive(&invalid) {
        Err(KdfError::Worker(message)) => {
            assert!(message.contains("invalid argon2 parameters"), "{message}")
        }
        other => panic!("unexpected result {other:?}"),
    }
    Ok(())
}

#[test]
fn worker_rejects_garbage() -> Result<()> {
    let tmp = TempDir::new()?;
    let mut child = Command::new(EXE)
        .arg(WORKER_ARG)
        .env(LOCK_FILE_ENV, tmp.path().join("argon2.lock"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(b"\0\0\0\x03xyz")?;
    }
    let output = child.wait_with_output()?;
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).starts_with("cannot run argon2 request"));
    assert!(!tmp.path().join("argon2.lock").exists());
    Ok(())
}

#[test]
fn worker_argument_must_stand_alone() -> Result<()> {
    let output = Command::new(EXE)
        .args([WORKER_ARG, "extra"])
        .stdin(Stdio::null())
        .output()?;
    assert_eq!(output.status.code(), Some(2));
    Ok(())
}
