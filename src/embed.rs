//! Standalone builds: `build` appends the site root (as a CBOR archive
//! under a `content/` prefix) to a copy of the running executable, behind a
//! magic trailer. At startup the binary checks for the trailer and extracts
//! the archive to a temp directory, which becomes the site root.
//!
//! Trailer layout, from the end of the file:
//! `[payload][payload_len: u64 le][MAGIC]`.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::prelude::*;

const MAGIC: &[u8; 8] = b"TKDSITE1";

#[derive(Serialize, Deserialize)]
struct Archive {
    /// (prefixed relative path, contents).
    files: Vec<(String, Vec<u8>)>,
}

/// Produce a standalone binary embedding `dir`. Returns the output path.
pub fn build(dir: &Path, output: Option<&Path>, target: Option<&str>) -> Result<PathBuf> {
    if let Some(target) = target {
        // Cross builds would need a toolchain per target; the embedded
        // payload itself is target-independent.
        warn!("--target {target} ignored: embedding into the running executable's own binary.");
    }

    let root = dir
        .canonicalize()
        .wrap_err_with(|| format!("Site root {} does not exist.", dir.display()))?;

    let mut files = Vec::new();
    for entry in WalkDir::new(&root)
        .into_iter()
        .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let rel = entry
            .path()
            .strip_prefix(&root)
            .expect("walked entries live under the root");

        files.push((
            format!("{EMBED_PREFIX}{}", rel.to_string_lossy()),
            std::fs::read(entry.path())?,
        ));
    }

    ensure!(!files.is_empty(), "Site root {} is empty.", root.display());

    let payload = serde_cbor::to_vec(&Archive { files })
        .wrap_err("Failed to encode the site archive.")?;

    let exe = std::env::current_exe().wrap_err("Cannot locate the running executable.")?;
    let out = output.map(Path::to_owned).unwrap_or_else(|| {
        let stem = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "site".into());
        PathBuf::from(stem)
    });

    std::fs::copy(&exe, &out)
        .wrap_err_with(|| format!("Failed to copy the executable to {}.", out.display()))?;

    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&out)
        .wrap_err("Failed to open the output binary for appending.")?;

    use std::io::Write as IoWrite;
    file.write_all(&payload)?;
    file.write_all(&(payload.len() as u64).to_le_bytes())?;
    file.write_all(MAGIC)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&out)?.permissions();
        perms.set_mode(perms.mode() | 0o111);
        std::fs::set_permissions(&out, perms)?;
    }

    info!(
        "Embedded {} byte payload into {}.",
        payload.len(),
        out.display()
    );

    Ok(out)
}

/// If the running executable carries an embedded site, extract it and
/// return the extracted root.
pub fn extract_embedded() -> Result<Option<PathBuf>> {
    let exe = std::env::current_exe()?;
    let Some(payload) = read_payload(&exe)? else {
        return Ok(None);
    };

    let archive: Archive =
        serde_cbor::from_slice(&payload).wrap_err("Corrupt embedded site archive.")?;

    let root = std::env::temp_dir().join(format!("tinkerdown-embedded-{}", std::process::id()));
    std::fs::create_dir_all(&root)?;

    for (name, contents) in archive.files {
        let rel = name.strip_prefix(EMBED_PREFIX).unwrap_or(&name);

        // Never follow anything that escapes the extraction root.
        if rel.split('/').any(|part| part == "..") {
            bail!("Embedded archive contains an escaping path: {name}");
        }

        let dest = root.join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, contents)?;
    }

    info!("Extracted embedded site to {}.", root.display());
    Ok(Some(root))
}

fn read_payload(exe: &Path) -> Result<Option<Vec<u8>>> {
    let mut file = std::fs::File::open(exe)?;
    let len = file.metadata()?.len();

    let trailer = (MAGIC.len() + 8) as u64;
    if len < trailer {
        return Ok(None);
    }

    file.seek(SeekFrom::End(-(trailer as i64)))?;
    let mut tail = [0u8; 16];
    file.read_exact(&mut tail)?;

    if &tail[8..] != MAGIC {
        return Ok(None);
    }

    let payload_len = u64::from_le_bytes(tail[..8].try_into().unwrap());
    if payload_len == 0 || payload_len > len - trailer {
        return Ok(None);
    }

    file.seek(SeekFrom::End(-((trailer + payload_len) as i64)))?;
    let mut payload = vec![0u8; payload_len as usize];
    file.read_exact(&mut payload)?;

    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_round_trips_through_cbor() {
        let archive = Archive {
            files: vec![
                ("content/index.md".into(), b"# Home\n".to_vec()),
                ("content/data/items.json".into(), b"[]".to_vec()),
            ],
        };

        let bytes = serde_cbor::to_vec(&archive).unwrap();
        let back: Archive = serde_cbor::from_slice(&bytes).unwrap();

        assert_eq!(back.files.len(), 2);
        assert_eq!(back.files[0].0, "content/index.md");
        assert_eq!(back.files[1].1, b"[]");
    }

    #[test]
    fn plain_binary_has_no_payload() {
        // Our own test binary carries no trailer.
        let exe = std::env::current_exe().unwrap();
        assert!(read_payload(&exe).unwrap().is_none());
    }
}
