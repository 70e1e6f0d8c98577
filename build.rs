//! Build script to stamp binaries with the source revision

use std::process::Command;

fn main() {
    println!("cargo:rerun-if-env-changed=TRIP_TRACE_GIT_HASH");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads");

    // Packaged builds have no .git, so allow the hash to be passed in
    let git_hash = std::env::var("TRIP_TRACE_GIT_HASH").ok().filter(|h| !h.is_empty()).unwrap_or_else(|| {
        match Command::new("git").args(["describe", "--always", "--dirty"]).output() {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout).trim().to_string(),
            _ => String::from("unknown"),
        }
    });

    println!("cargo:rustc-env=GIT_HASH={}", git_hash);
}
