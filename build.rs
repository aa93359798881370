fn main() {
    if let Some(build_static) = option_env!("FDE_UNLOCK_BUILD_STATIC") {
        if matches!(
            build_static.to_lowercase().as_ref(),
            "1" | "y" | "yes" | "true"
        ) {
            println!("cargo:rustc-link-arg=-l:libc.a");
            if std::env::var_os("CARGO_FEATURE_TPM").is_some() {
                println!("cargo:rustc-link-arg=-l:libtss2-tcti-device.a");
                println!("cargo:rustc-link-lib=static=tss2-esys");
                println!("cargo:rustc-link-lib=static=tss2-mu");
                println!("cargo:rustc-link-lib=static=tss2-sys");
                println!("cargo:rustc-link-lib=static=crypto");
                println!("cargo:rustc-link-lib=static=ssl");
            }
            if std::env::var_os("CARGO_FEATURE_LIBCRYPTSETUP").is_some() {
                println!("cargo:rustc-link-lib=static=cryptsetup");
                println!("cargo:rustc-link-lib=static=devmapper");
                println!("cargo:rustc-link-lib=static=json-c");
                println!("cargo:rustc-link-lib=static=uuid");
            }
            println!("cargo:rustc-link-search=/usr/lib");
            println!("cargo:rustc-link-search=/usr/local/ssl/lib");
        }
    }
}
