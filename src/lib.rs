//! Boot-time unlocking of encrypted volumes.
//!
//! [`unlock::Unlocker`] finds a volume by its filesystem label and opens it
//! with a TPM-sealed key, a key revealed by the platform's `fde-reveal-key`
//! hook, a partition handed to `fde-device-unlock`, or a recovery key.
//! [`bootchain`] builds the image load trees sealing policies are computed
//! from, and [`kdf`] stretches passphrases with Argon2 in a worker process.
//!
//! ## Features
//! - `tpm`: unseal through tss-esapi instead of treating the machine as
//!   having no TPM.
//! - `libcryptsetup`: activate through libcryptsetup instead of the
//!   `cryptsetup` binary.

mod b64;
pub mod bootchain;
pub mod cli;
pub mod config;
pub mod disk;
pub mod fde;
pub mod kdf;
pub mod luks;
pub mod recovery;
pub mod tpm;
pub mod unlock;

#[cfg(test)]
mod testutil;
