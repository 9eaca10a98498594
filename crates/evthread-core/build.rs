fn main() {
    // Targets whose native pthread rwlock is known to keep writers from starving
    // under continuous reader arrival, and targets where the crate substitutes a
    // task-fair lock for `RwLockPolicy::NoWriterStarvation`.
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    match target_os.as_str() {
        "macos" | "freebsd" | "linux" | "android" => {}
        other => {
            println!(
                "cargo:warning=evthread: default RwLock policy on target_os={other} may \
                 allow writer starvation; use RwLockPolicy::NoWriterStarvation for \
                 read-mostly tables with writers"
            );
        }
    }
    println!("cargo:rerun-if-changed=build.rs");
}
