//! `blinkgate setup`: downloads and verifies the pinned ONNX models.

use anyhow::{bail, Context, Result};
use blinkgate_models::{sha256_file_hex, ModelFile, MODELS};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Landmark model file the daemon expects; not downloadable from a pinned source.
const LANDMARK_MODEL: &str = "face_landmark.onnx";

/// `/var/lib/blinkgate/models` for root, `$XDG_DATA_HOME/blinkgate/models` otherwise.
pub fn default_model_dir() -> PathBuf {
    if is_root() {
        PathBuf::from("/var/lib/blinkgate/models")
    } else {
        let data_home = std::env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            format!("{home}/.local/share")
        });
        PathBuf::from(data_home).join("blinkgate/models")
    }
}

fn is_root() -> bool {
    // SAFETY: geteuid is always safe to call.
    unsafe { libc::geteuid() == 0 }
}

/// Download a single model file with progress output.
fn download_model(model: &ModelFile, dest: &Path) -> Result<()> {
    let tmp_path = dest.with_extension("onnx.part");

    println!("  downloading {} ({})...", model.name, model.size_display);

    let resp = ureq::get(model.url)
        .call()
        .with_context(|| format!("failed to download {}", model.url))?;

    let content_length = resp
        .headers()
        .get("Content-Length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let mut reader = resp.into_body().into_reader();
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut buf = [0u8; 65536];
    let mut total: u64 = 0;
    let mut last_decile: u64 = 0;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        total += n as u64;

        if let Some(len) = content_length.filter(|&l| l > 0) {
            let pct = (total * 100) / len;
            if pct / 10 > last_decile {
                print!("  {pct}%\r");
                io::stdout().flush().ok();
                last_decile = pct / 10;
            }
        }
    }

    file.flush()?;
    drop(file);

    print!("  verifying checksum... ");
    io::stdout().flush().ok();
    let digest = sha256_file_hex(&tmp_path)?;
    if digest != model.sha256 {
        fs::remove_file(&tmp_path).ok();
        bail!(
            "checksum mismatch for {}:\n  expected: {}\n  got:      {}",
            model.name,
            model.sha256,
            digest
        );
    }
    println!("ok");

    fs::rename(&tmp_path, dest).with_context(|| {
        format!(
            "failed to rename {} -> {}",
            tmp_path.display(),
            dest.display()
        )
    })?;

    Ok(())
}

/// Whether a present file already matches its pinned checksum.
fn is_current(model: &ModelFile, dest: &Path) -> bool {
    if !dest.exists() {
        return false;
    }
    match sha256_file_hex(dest) {
        Ok(digest) if digest == model.sha256 => true,
        Ok(_) => {
            println!("  {} exists but checksum differs, re-downloading", model.name);
            false
        }
        Err(_) => {
            println!("  {} exists but unreadable, re-downloading", model.name);
            false
        }
    }
}

/// Run the setup command: download and verify ONNX models.
pub fn run(model_dir: Option<String>) -> Result<()> {
    let dir = match model_dir {
        Some(d) => PathBuf::from(d),
        None => default_model_dir(),
    };

    println!("Model directory: {}", dir.display());

    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let mut downloaded = 0;
    let mut skipped = 0;

    for model in MODELS {
        let dest = dir.join(model.name);
        if is_current(model, &dest) {
            println!("  {} already present (checksum ok)", model.name);
            skipped += 1;
            continue;
        }
        download_model(model, &dest)?;
        downloaded += 1;
    }

    println!();
    if downloaded > 0 {
        println!("Setup complete: {downloaded} model(s) downloaded, {skipped} already present.");
    } else {
        println!("All pinned models already present. Nothing to download.");
    }

    if !dir.join(LANDMARK_MODEL).exists() {
        println!(
            "note: place a 468-point face mesh model at {} before starting blinkgated",
            dir.join(LANDMARK_MODEL).display()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_current_checks_digest() {
        let dir = std::env::temp_dir().join(format!(
            "blinkgate-setup-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        fs::create_dir_all(&dir).unwrap();
        let model = &MODELS[0];
        let dest = dir.join(model.name);

        assert!(!is_current(model, &dest));
        fs::write(&dest, b"truncated download").unwrap();
        assert!(!is_current(model, &dest));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_default_dir_ends_with_models() {
        assert!(default_model_dir().ends_with("blinkgate/models"));
    }
}
