use std::path::{Path, PathBuf};
use std::process::Command;

const UNKNOWN_SHA: &str = "unknown";

fn main() {
    let manifest_dir = PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").unwrap());
    println!("cargo:rustc-env=GIT_SHA={}", short_git_sha(&manifest_dir));
    watch_git_head(&manifest_dir);
}

/// Shells out to `git rev-parse --short HEAD` so the binary can log which
/// commit it was built from. Falls back to a fixed placeholder when the
/// build isn't happening inside a git checkout (e.g. a source tarball).
fn short_git_sha(manifest_dir: &Path) -> String {
    Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .current_dir(manifest_dir)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| UNKNOWN_SHA.to_string())
}

/// Ties cargo's rebuild trigger to the workspace's HEAD/refs moving,
/// instead of re-running this script on every source-file touch.
fn watch_git_head(manifest_dir: &Path) {
    let git_dir = manifest_dir.join("../../.git");
    if !git_dir.exists() {
        return;
    }
    println!("cargo:rerun-if-changed={}", git_dir.join("HEAD").display());
    println!("cargo:rerun-if-changed={}", git_dir.join("refs").display());
    println!("cargo:rerun-if-changed={}", git_dir.join("packed-refs").display());
}
