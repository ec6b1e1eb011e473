//! Integration tests driving the built ksvk binary
//!
//! Run via `cargo xtask integration`, which builds the release binary and
//! points KSVK_PATH at it. The VM-launching trial needs a real installer
//! ISO and is skipped unless KSVK_TEST_ISO is set.

use std::path::Path;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};

mod tests {
    pub mod pipeline;
}

/// Get the path to the ksvk binary, checking KSVK_PATH env var first
pub(crate) fn get_ksvk_command() -> Result<String> {
    if let Ok(path) = std::env::var("KSVK_PATH") {
        // The trials change directories, so a relative path must be pinned
        let canonical = std::fs::canonicalize(&path)
            .map_err(|e| eyre!("Resolving KSVK_PATH={path}: {e}"))?;
        return Ok(canonical.to_string_lossy().into_owned());
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/ksvk", "target/release/ksvk"]
        .into_iter()
        .find(|p| Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set KSVK_PATH={path} to run using this binary"
        ));
    }
    Ok("ksvk".to_owned())
}

fn main() {
    let args = Arguments::from_args();

    let have_test_iso = std::env::var_os("KSVK_TEST_ISO").is_some();

    let tests = vec![
        Trial::test("missing_password_fails_validation", || {
            tests::pipeline::test_missing_password_fails_validation()?;
            Ok(())
        }),
        Trial::test("missing_iso_fails_in_acquire_step", || {
            tests::pipeline::test_missing_iso_fails_in_acquire_step()?;
            Ok(())
        }),
        Trial::test("cached_iso_reaches_remaster_step", || {
            tests::pipeline::test_cached_iso_reaches_remaster_step()?;
            Ok(())
        }),
        Trial::test("unattended_install_end_to_end", || {
            tests::pipeline::test_unattended_install_end_to_end()?;
            Ok(())
        })
        .with_ignored_flag(!have_test_iso),
    ];

    libtest_mimic::run(&args, tests).exit();
}
