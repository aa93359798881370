use crate::bootchain::build_load_sequences;
use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::kdf::{Argon2Kdf, Argon2Mode, DeriveJob, OutOfProcessKdf};
use crate::unlock::{Platform, UnlockMechanism, UnlockOptions, UnlockResult, Unlocker};
use clap::{Parser, Subcommand};
use eyre::{eyre, Result, WrapErr};
use log::info;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use zeroize::Zeroizing;

const CONFIG_ENV_VAR: &str = "FDE_UNLOCK_CONFIG";
#[cfg(feature = "tpm")]
const TPM_ENV_VAR: &str = "TCTI";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH, env = CONFIG_ENV_VAR)]
    config: PathBuf,

    /// TPM device specified in TCTI format
    #[cfg(feature = "tpm")]
    #[arg(short = 'T', long, default_value = crate::tpm::DEFAULT_TCTI, env = TPM_ENV_VAR)]
    tcti: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Unlock a volume with its sealed key if it is encrypted
    Unlock {
        /// Volume name, e.g. `ubuntu-data`
        #[arg(value_name = "name")]
        name: String,
        #[arg(long, value_name = "FILE")]
        sealed_key_file: PathBuf,
        /// Ask for a recovery key when the sealed key cannot be used
        #[arg(long)]
        allow_recovery_key: bool,
        /// Block the sealed keys afterwards
        #[arg(long)]
        lock_keys_on_finish: bool,
    },
    /// Unlock an encrypted volume with a key read from a file
    UnlockWithKey {
        #[arg(value_name = "name")]
        name: String,
        #[arg(long, value_name = "FILE")]
        key_file: PathBuf,
    },
    /// Make the sealed keys unusable until the next boot
    LockSealedKeys,
    /// Show the image load trees of boot file sequences
    LoadSequences {
        /// Comma separated boot files in load order
        #[arg(long = "chain", value_name = "FILES", required = true, value_parser = parse_chain)]
        chains: Vec<Chain>,
    },
    /// Stretch a passphrase read from stdin with Argon2
    DeriveKey {
        /// Salt in hex
        #[arg(long)]
        salt: String,
        #[arg(long, default_value = "argon2id", value_parser = parse_mode)]
        mode: Argon2Mode,
        #[arg(long, default_value_t = 4)]
        time_cost: u32,
        #[arg(long, default_value_t = 1 << 20)]
        memory_kib: u32,
        #[arg(long, default_value_t = 4)]
        threads: u32,
        #[arg(long, default_value_t = 32)]
        key_len: u32,
    },
}

#[derive(Clone, Debug)]
struct Chain(Vec<PathBuf>);

fn parse_chain(s: &str) -> Result<Chain, String> {
    let files: Vec<PathBuf> = s
        .split(',')
        .filter(|f| !f.is_empty())
        .map(PathBuf::from)
        .collect();
    if files.is_empty() {
        return Err("expected at least one boot file".to_owned());
    }
    Ok(Chain(files))
}

fn parse_mode(s: &str) -> Result<Argon2Mode, String> {
    match s {
        "argon2i" => Ok(Argon2Mode::Argon2i),
        "argon2id" => Ok(Argon2Mode::Argon2id),
        _ => Err(format!("unknown argon2 mode {s:?}")),
    }
}

impl Cli {
    pub fn new() -> Self {
        Cli::parse()
    }

    pub fn run(&self) -> Result<()> {
        let config = Config::load(&self.config)?;
        match &self.command {
            Commands::Unlock {
                name,
                sealed_key_file,
                allow_recovery_key,
                lock_keys_on_finish,
            } => {
                let options = UnlockOptions {
                    allow_recovery_key: *allow_recovery_key,
                    recovery_key_tries: config.recovery_key_tries,
                    lock_keys_on_finish: *lock_keys_on_finish,
                    ..UnlockOptions::default()
                };
                let unlocker = self.unlocker(&config)?;
                match unlocker.unlock_volume_if_encrypted(name, sealed_key_file, &options) {
                    Ok(result) => print_result(&result)?,
                    Err(failure) => {
                        print_result(&failure.result)?;
                        return Err(failure.into());
                    }
                }
            }
            Commands::UnlockWithKey { name, key_file } => {
                let key = Zeroizing::new(
                    fs::read(key_file)
                        .wrap_err_with(|| format!("cannot read key file {}", key_file.display()))?,
                );
                let unlocker = self.unlocker(&config)?;
                match unlocker.unlock_volume_with_key(name, &key) {
                    Ok(result) => print_result(&result)?,
                    Err(failure) => {
                        print_result(&failure.result)?;
                        return Err(failure.into());
                    }
                }
            }
            Commands::LockSealedKeys => self.unlocker(&config)?.lock_sealed_keys()?,
            Commands::LoadSequences { chains } => {
                let sequences: Vec<Vec<PathBuf>> = chains.iter().map(|c| c.0.clone()).collect();
                for root in build_load_sequences(&sequences)? {
                    print!("{root}");
                }
            }
            Commands::DeriveKey {
                salt,
                mode,
                time_cost,
                memory_kib,
                threads,
                key_len,
            } => {
                let salt = hex::decode(salt).wrap_err("salt is not valid hex")?;
                let mut passphrase = Zeroizing::new(Vec::new());
                io::stdin()
                    .read_to_end(&mut passphrase)
                    .wrap_err("cannot read passphrase")?;
                let len = passphrase
                    .strip_suffix(b"\n")
                    .map_or(passphrase.len(), <[u8]>::len);
                let job = DeriveJob {
                    mode: *mode,
                    passphrase: passphrase[..len].to_vec(),
                    salt,
                    time_cost: *time_cost,
                    memory_kib: *memory_kib,
                    threads: *threads,
                    key_len: *key_len,
                };
                let kdf = config.argon2.configure(OutOfProcessKdf::for_current_exe()?);
                let key = kdf.derive(&job)?;
                println!("{}", hex::encode(&*key));
            }
        };
        Ok(())
    }

    fn unlocker(&self, config: &Config) -> Result<Unlocker> {
        let hooks = config.hooks()?;
        #[allow(unused_mut)]
        let mut platform = Platform::system(Box::new(hooks));
        #[cfg(feature = "tpm")]
        {
            platform.tpm = Box::new(crate::tpm::TssConnector::new(&self.tcti));
        }
        let mechanism = UnlockMechanism::detect(config.hook_dir.as_deref());
        info!("unlocking through {mechanism:?}");
        Ok(Unlocker::new(platform, mechanism))
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self::new()
    }
}

fn print_result(result: &UnlockResult) -> Result<()> {
    print!(
        "{}",
        serde_yaml::to_string(result).map_err(|e| eyre!("cannot format result: {e}"))?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_unlock() {
        let cli = Cli::try_parse_from([
            "fde-unlock",
            "--config",
            "/tmp/fde.yaml",
            "unlock",
            "ubuntu-data",
            "--sealed-key-file",
            "/run/ubuntu-data.sealed-key",
            "--allow-recovery-key",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/fde.yaml"));
        match cli.command {
            Commands::Unlock {
                name,
                sealed_key_file,
                allow_recovery_key,
                lock_keys_on_finish,
            } => {
                assert_eq!(name, "ubuntu-data");
                assert_eq!(sealed_key_file, PathBuf::from("/run/ubuntu-data.sealed-key"));
                assert!(allow_recovery_key);
                assert!(!lock_keys_on_finish);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_chains() {
        let cli = Cli::try_parse_from([
            "fde-unlock",
            "load-sequences",
            "--chain",
            "shim.efi,grub.efi,kernel.efi",
            "--chain",
            "shim.efi,other.efi",
        ])
        .unwrap();
        match cli.command {
            Commands::LoadSequences { chains } => {
                assert_eq!(chains.len(), 2);
                assert_eq!(
                    chains[0].0,
                    ["shim.efi", "grub.efi", "kernel.efi"].map(PathBuf::from)
                );
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["fde-unlock", "load-sequences", "--chain", ","]).is_err());
    }

    #[test]
    fn rejects_unknown_mode() {
        assert!(Cli::try_parse_from([
            "fde-unlock",
            "derive-key",
            "--salt",
            "00",
            "--mode",
            "argon2d"
        ])
        .is_err());
    }
}
