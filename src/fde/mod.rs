//! Requests to the `fde-reveal-key` and `fde-device-unlock` hooks shipped by
//! platforms that do not unseal through the TPM.

pub mod runner;

use self::runner::{HelperError, HelperRunner, PollTiming};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::Zeroizing;

pub const REVEAL_KEY_HOOK: &str = "fde-reveal-key";
pub const DEVICE_UNLOCK_HOOK: &str = "fde-device-unlock";
/// `platform_name` of sealed key files written for v2 hooks.
pub const KEY_DATA_PLATFORM: &str = "fde-hook-v2";

#[derive(Error, Debug)]
pub enum FdeError {
    #[error("cannot build request for {hook}: {source}")]
    Request {
        hook: &'static str,
        source: serde_json::Error,
    },
    #[error("cannot run {hook} {op:?}: {}", describe(.source))]
    Run {
        hook: &'static str,
        op: &'static str,
        #[source]
        source: HelperError,
    },
    #[error("invalid key data revealed by {hook}: {source}")]
    InvalidKey {
        hook: &'static str,
        source: serde_json::Error,
    },
    #[error("{hook} revealed an empty key")]
    EmptyKey { hook: &'static str },
    #[error("sealed key data is for platform {0:?}, expected \"fde-hook-v2\"")]
    UnsupportedPlatform(String),
}

pub type Result<T, E = FdeError> = core::result::Result<T, E>;

fn describe(err: &HelperError) -> String {
    match err.output() {
        Some(output) if !output.is_empty() => format!(
            "\n-----\n{}\n-----",
            String::from_utf8_lossy(output).trim()
        ),
        _ => err.to_string(),
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RevealOp {
    Reveal,
    Lock,
}

impl RevealOp {
    fn as_str(&self) -> &'static str {
        match self {
            RevealOp::Reveal => "reveal",
            RevealOp::Lock => "lock",
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct RevealKeyRequest {
    pub op: RevealOp,
    #[serde(skip_serializing_if = "Vec::is_empty", with = "crate::b64")]
    pub sealed_key: Vec<u8>,
    /// Opaque platform handle stored next to a v2 payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key_name: String,
}

impl RevealKeyRequest {
    pub fn reveal(sealed_key: Vec<u8>, key_name: &str) -> Self {
        Self {
            op: RevealOp::Reveal,
            sealed_key,
            handle: None,
            key_name: key_name.to_owned(),
        }
    }

    /// Builds the reveal request for the content of a sealed key file. v2
    /// files hold JSON key data whose payload and handle are sent, anything
    /// else is a raw v1 sealed key sent as is.
    pub fn for_sealed_key_file(content: Vec<u8>, key_name: &str) -> Result<Self> {
        let data = match serde_json::from_slice::<KeyData>(&content) {
            Ok(data) => data,
            Err(_) => return Ok(Self::reveal(content, key_name)),
        };
        if data.platform_name != KEY_DATA_PLATFORM {
            return Err(FdeError::UnsupportedPlatform(data.platform_name));
        }
        // key data sealed by a v1 hook is marked so and must not carry a handle
        let handle = data
            .platform_handle
            .filter(|h| h.get(V1_NO_HANDLE) != Some(&Value::Bool(true)));
        Ok(Self {
            handle,
            ..Self::reveal(data.encrypted_payload, key_name)
        })
    }

    pub fn lock() -> Self {
        Self {
            op: RevealOp::Lock,
            sealed_key: Vec::new(),
            handle: None,
            key_name: String::new(),
        }
    }
}

const V1_NO_HANDLE: &str = "v1-no-handle";

#[derive(Deserialize)]
struct KeyData {
    platform_name: String,
    #[serde(default)]
    platform_handle: Option<Value>,
    #[serde(with = "crate::b64")]
    encrypted_payload: Vec<u8>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceUnlockRequest {
    op: &'static str,
    #[serde(with = "crate::b64")]
    pub key: Vec<u8>,
    pub device: PathBuf,
    pub partition_name: String,
}

impl DeviceUnlockRequest {
    pub fn new(key: Vec<u8>, device: &Path, partition_name: &str) -> Self {
        Self {
            op: "device-unlock",
            key,
            device: device.to_path_buf(),
            partition_name: partition_name.to_owned(),
        }
    }
}

#[derive(Deserialize)]
struct RevealKeyResult {
    #[serde(with = "crate::b64")]
    key: Vec<u8>,
}

/// v1 hooks print the raw key, v2 hooks a `{"key": "<base64>"}` object.
/// Neither may reveal an empty key.
pub fn parse_revealed_key(output: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let key = match output.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b'{') => {
            let result: RevealKeyResult =
                serde_json::from_slice(output).map_err(|source| FdeError::InvalidKey {
                    hook: REVEAL_KEY_HOOK,
                    source,
                })?;
            result.key
        }
        Some(_) => output.to_vec(),
        None => Vec::new(),
    };
    if key.is_empty() {
        return Err(FdeError::EmptyKey {
            hook: REVEAL_KEY_HOOK,
        });
    }
    Ok(Zeroizing::new(key))
}

/// The hooks a platform can ship instead of TPM based unsealing.
pub trait FdeHooks {
    /// Sends a request to `fde-reveal-key`. For [`RevealOp::Reveal`] this is
    /// the unsealed key, for [`RevealOp::Lock`] it is empty.
    fn reveal_key(&self, request: &RevealKeyRequest) -> Result<Zeroizing<Vec<u8>>>;

    fn device_unlock(&self, request: &DeviceUnlockRequest) -> Result<()>;
}

/// Whether `path` is a file anybody may execute.
fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Looks for hook `name` in `hook_dir`, or on `PATH` without one.
pub fn find_hook(name: &str, hook_dir: Option<&Path>) -> Option<PathBuf> {
    match hook_dir {
        Some(dir) => Some(dir.join(name)).filter(|p| is_executable(p)),
        None => env::var_os("PATH").and_then(|paths| {
            env::split_paths(&paths)
                .map(|dir| dir.join(name))
                .find(|p| is_executable(p))
        }),
    }
}

/// Runs the hooks under `systemd-run`.
#[derive(Debug, Clone)]
pub struct SystemdHooks {
    reveal_key: HelperRunner,
    device_unlock: HelperRunner,
}

impl SystemdHooks {
    pub fn new(hook_dir: Option<&Path>, run_root: &Path) -> Self {
        let hook = |name: &str| match hook_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        };
        Self {
            reveal_key: HelperRunner::new(REVEAL_KEY_HOOK, hook(REVEAL_KEY_HOOK), run_root),
            device_unlock: HelperRunner::new(
                DEVICE_UNLOCK_HOOK,
                hook(DEVICE_UNLOCK_HOOK),
                run_root,
            ),
        }
    }

    pub fn with_supervisor(self, supervisor: &Path, args: Vec<String>) -> Self {
        Self {
            reveal_key: self.reveal_key.with_supervisor(supervisor, args.clone()),
            device_unlock: self.device_unlock.with_supervisor(supervisor, args),
        }
    }

    pub fn with_timing(self, timing: PollTiming) -> Self {
        Self {
            reveal_key: self.reveal_key.with_timing(timing),
            device_unlock: self.device_unlock.with_timing(timing),
        }
    }
}

impl FdeHooks for SystemdHooks {
    fn reveal_key(&self, request: &RevealKeyRequest) -> Result<Zeroizing<Vec<u8>>> {
        let stdin = serde_json::to_vec(request).map_err(|source| FdeError::Request {
            hook: REVEAL_KEY_HOOK,
            source,
        })?;
        let output = self
            .reveal_key
            .run(&stdin)
            .map_err(|source| FdeError::Run {
                hook: REVEAL_KEY_HOOK,
                op: request.op.as_str(),
                source,
            })?;
        match request.op {
            RevealOp::Reveal => parse_revealed_key(&output),
            RevealOp::Lock => Ok(Zeroizing::new(Vec::new())),
        }
    }

    fn device_unlock(&self, request: &DeviceUnlockRequest) -> Result<()> {
        let stdin = Zeroizing::new(serde_json::to_vec(request).map_err(|source| {
            FdeError::Request {
                hook: DEVICE_UNLOCK_HOOK,
                source,
            }
        })?);
        self.device_unlock
            .run(&stdin)
            .map_err(|source| FdeError::Run {
                hook: DEVICE_UNLOCK_HOOK,
                op: request.op,
                source,
            })?;
        Ok(())
    }
}
