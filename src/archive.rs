use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct BatchArchive {
    pub path: PathBuf,
    pub bytes: u64,
    pub entries: usize,
    pub sha256: String,
}

/// Zips a batch folder next to it as `batch_<id>.zip`, replacing any earlier archive.
pub fn create_batch_archive(paths: &AppPaths, batch_id: &str) -> Result<BatchArchive> {
    let dir = paths.batch_dir(batch_id);
    if !dir.is_dir() {
        return Err(EngineError::NotFound {
            kind: "batch folder",
            id: batch_id.to_string(),
        });
    }

    let out_path = paths.batch_archive_path(batch_id);
    let tmp_path = out_path.with_extension("zip.tmp");
    let entries = match write_archive(&dir, &tmp_path) {
        Ok(entries) => entries,
        Err(err) => {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(err);
        }
    };
    if out_path.exists() {
        std::fs::remove_file(&out_path)?;
    }
    std::fs::rename(&tmp_path, &out_path)?;

    let bytes = std::fs::metadata(&out_path).map(|m| m.len()).unwrap_or(0);
    let sha256 = sha256_file_hex(&out_path)?;
    Ok(BatchArchive {
        path: out_path,
        bytes,
        entries,
        sha256,
    })
}

fn write_archive(dir: &Path, out_path: &Path) -> Result<usize> {
    let file = std::fs::File::create(out_path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let mut files = Vec::new();
    collect_files(dir, &mut files)?;
    files.sort();

    let mut entries = 0;
    for path in &files {
        let Ok(rel) = path.strip_prefix(dir) else {
            continue;
        };
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");
        add_file(&mut zip, &name, path, options)?;
        entries += 1;
    }

    zip.finish()?;
    Ok(entries)
}

fn add_file<W: Write + Seek>(
    zip: &mut zip::ZipWriter<W>,
    name: &str,
    path: &Path,
    options: zip::write::FileOptions,
) -> Result<()> {
    zip.start_file(name, options)?;
    let mut file = std::fs::File::open(path)?;
    std::io::copy(&mut file, zip)?;
    Ok(())
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            collect_files(&path, out)?;
        } else if file_type.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

fn sha256_file_hex(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut file = std::fs::File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
