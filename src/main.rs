/// To build a static binary for the initramfs:
/// ```
/// FDE_UNLOCK_BUILD_STATIC=1 cargo build --release --target=x86_64-unknown-linux-musl
/// ```
use eyre::Result;
use fde_unlock::cli::Cli;
use fde_unlock::kdf::{worker, Mode};
use std::env;

fn main() -> Result<()> {
    // the argon2 worker speaks its protocol on stdio and must not parse argv
    if Mode::from_args(env::args_os()) == Mode::Worker {
        worker::run_process();
    }

    let cli = Cli::new();
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    #[cfg(feature = "tpm")]
    env::set_var("TSS2_LOG", "all+NONE");
    cli.run()
}
