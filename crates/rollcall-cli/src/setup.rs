//! `rollcall setup` — downloads the model files the pipeline needs.

use anyhow::{bail, Context, Result};
use rollcall_models::{default_model_dir, sha256_file_hex, ModelFile, MODELS};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Download a single model file with progress output.
fn download_model(model: &ModelFile, dest: &Path) -> Result<()> {
    let tmp_path = dest.with_extension("part");

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
    let mut last_pct: u64 = 0;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        total += n as u64;

        // Print progress every 10%
        if let Some(len) = content_length {
            let pct = (total * 100) / len;
            if pct / 10 > last_pct / 10 {
                print!("  {pct}%\r");
                io::stdout().flush().ok();
                last_pct = pct;
            }
        }
    }

    file.flush()?;
    drop(file);

    if let Some(expected) = model.sha256 {
        print!("  verifying checksum... ");
        io::stdout().flush().ok();
        let digest = sha256_file_hex(&tmp_path)?;
        if digest != expected {
            fs::remove_file(&tmp_path).ok();
            bail!(
                "checksum mismatch for {}:\n  expected: {}\n  got:      {}",
                model.name,
                expected,
                digest
            );
        }
        println!("ok");
    } else {
        println!("  no published checksum for {} — skipping verification", model.name);
    }

    // Atomic rename
    fs::rename(&tmp_path, dest).with_context(|| {
        format!(
            "failed to rename {} -> {}",
            tmp_path.display(),
            dest.display()
        )
    })?;

    Ok(())
}

/// Run the setup command: download and verify model files.
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
        if dest.exists() {
            match model.sha256 {
                Some(expected) => match sha256_file_hex(&dest) {
                    Ok(digest) if digest == expected => {
                        println!("  {} already present (checksum ok)", model.name);
                        skipped += 1;
                        continue;
                    }
                    Ok(_) => {
                        println!(
                            "  {} exists but checksum differs — re-downloading",
                            model.name
                        );
                    }
                    Err(_) => {
                        println!("  {} exists but unreadable — re-downloading", model.name);
                    }
                },
                None => {
                    println!("  {} already present", model.name);
                    skipped += 1;
                    continue;
                }
            }
        }

        download_model(model, &dest)?;
        downloaded += 1;
    }

    println!();
    if downloaded > 0 {
        println!("Setup complete: {downloaded} model(s) downloaded, {skipped} already present.");
    } else {
        println!("All models already present. Nothing to download.");
    }

    Ok(())
}
