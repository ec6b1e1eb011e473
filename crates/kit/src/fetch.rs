//! Installer ISO acquisition
//!
//! The ISO is cached by path: when the file already exists no transfer of
//! any kind is attempted. Downloads land in a temporary file next to the
//! target and are renamed into place only on success, so an interrupted
//! transfer never poisons the cache.

use std::io::Read;

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use flate2::read::GzDecoder;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use crate::config::IsoSource;
use crate::utils::CommandRunExt;

/// Ensure the installer ISO exists locally, fetching it if necessary
///
/// The source is resolved lazily: a cache hit never consults (or requires)
/// any download configuration at all.
pub fn ensure_iso(
    iso_path: &Utf8Path,
    resolve_source: impl FnOnce() -> Result<Option<IsoSource>>,
) -> Result<()> {
    if iso_path.exists() {
        info!("ISO found at {iso_path}");
        return Ok(());
    }

    if let Some(parent) = iso_path.parent() {
        if !parent.as_str().is_empty() {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("Creating download directory {parent}"))?;
        }
    }

    match resolve_source()? {
        Some(IsoSource::Http { url }) => fetch_http(&url, iso_path),
        Some(IsoSource::Sftp {
            host,
            port,
            remote_path,
            user,
            password,
        }) => fetch_sftp(&host, port, &remote_path, &user, &password, iso_path),
        None => Err(eyre!(
            "ISO missing at {iso_path} and neither RHEL_ISO_URL nor SFTP config provided"
        )),
    }
}

fn download_progress_bar(size: Option<u64>) -> ProgressBar {
    match size {
        Some(size) => {
            let pb = ProgressBar::new(size);
            pb.set_style(
                ProgressStyle::with_template(
                    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes})",
                )
                .unwrap()
                .progress_chars("#>-"),
            );
            pb
        }
        None => ProgressBar::new_spinner(),
    }
}

fn fetch_http(url: &str, target: &Utf8Path) -> Result<()> {
    info!("Downloading ISO from {url} ...");
    let resp = reqwest::blocking::get(url)
        .and_then(|v| v.error_for_status())
        .wrap_err_with(|| format!("Fetching {url}"))?;
    let size = resp.content_length();
    debug!("Content length: {size:?}");

    let parent = target.parent().unwrap_or(Utf8Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .wrap_err("Creating temporary download file")?;

    let pb = download_progress_bar(size);
    let mut reader = pb.wrap_read(resp);
    if is_gzipped(url) {
        // Stream-decompress; the cache only ever holds the raw image
        let mut decoder = GzDecoder::new(reader);
        std::io::copy(&mut decoder, &mut tmp).wrap_err("Downloading and decompressing ISO")?;
    } else {
        std::io::copy(&mut reader, &mut tmp).wrap_err("Downloading ISO")?;
    }
    pb.finish_and_clear();

    tmp.persist(target)
        .wrap_err_with(|| format!("Persisting download to {target}"))?;
    info!("Download complete.");
    Ok(())
}

fn fetch_sftp(
    host: &str,
    port: u16,
    remote_path: &str,
    user: &str,
    password: &str,
    target: &Utf8Path,
) -> Result<()> {
    info!("Using SFTP for download...");
    info!("Connecting to {user}@{host}:{port}...");

    let parent = target.parent().unwrap_or(Utf8Path::new("."));
    let tmp = tempfile::NamedTempFile::new_in(parent)
        .wrap_err("Creating temporary download file")?;
    let tmp_path = tmp.path().to_path_buf();

    // The system scp client does the transfer; password auth goes through
    // sshpass as everywhere else in this tool.
    std::process::Command::new("sshpass")
        .args(["-p", password, "scp"])
        .args(["-P", &port.to_string()])
        .args(["-o", "StrictHostKeyChecking=no"])
        .args(["-o", "UserKnownHostsFile=/dev/null"])
        .arg(format!("{user}@{host}:{remote_path}"))
        .arg(&tmp_path)
        .run_checked()
        .wrap_err_with(|| format!("scp of {remote_path} from {host}"))?;

    if is_gzipped(remote_path) {
        info!("Decompressing into {target}...");
        let compressed =
            std::fs::File::open(&tmp_path).wrap_err("Opening downloaded archive")?;
        let mut decoder = GzDecoder::new(compressed);
        let mut out = std::fs::File::create(target)
            .wrap_err_with(|| format!("Creating {target}"))?;
        if let Err(e) = std::io::copy(&mut decoder, &mut out) {
            // Don't leave a truncated image behind for the next run to trust
            let _ = std::fs::remove_file(target);
            return Err(e).wrap_err("Decompressing ISO");
        }
        info!("Decompression complete.");
    } else {
        tmp.persist(target)
            .wrap_err_with(|| format!("Persisting download to {target}"))?;
    }
    info!("Download complete.");
    Ok(())
}

fn is_gzipped(path: &str) -> bool {
    path.ends_with(".gz")
}

/// Sanity check used by the fetch step before anything else runs
pub fn verify_readable(iso_path: &Utf8Path) -> Result<u64> {
    let mut f = std::fs::File::open(iso_path)
        .wrap_err_with(|| format!("Opening {iso_path}"))?;
    let len = f.metadata().wrap_err("Reading ISO metadata")?.len();
    if len == 0 {
        return Err(eyre!("ISO at {iso_path} is empty"));
    }
    // Read a little to catch permission or media errors early
    let mut probe = [0u8; 512];
    f.read_exact(&mut probe)
        .wrap_err_with(|| format!("Reading {iso_path}"))?;
    Ok(len)
}
