// dbkeeper/src/backup/archive.rs
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType};

/// Compresses a single file into a `.tar.gz` archive.
///
/// Only the file name is stored inside the archive, so extraction recreates
/// the file with the same name regardless of where it was dumped.
pub fn compress_file(source_file: &Path, archive_dest_path: &Path) -> Result<PathBuf> {
    if !source_file.is_file() {
        return Err(anyhow::anyhow!(
            "Source for archival is not a file: {}",
            source_file.display()
        ));
    }
    let file_name = source_file
        .file_name()
        .with_context(|| format!("Source file has no name: {}", source_file.display()))?;
    if let Some(parent) = archive_dest_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!(
                "Failed to create parent directory for archive: {}",
                parent.display()
            )
        })?;
    }

    let archive_file = File::create(archive_dest_path).with_context(|| {
        format!(
            "Failed to create archive file: {}",
            archive_dest_path.display()
        )
    })?;
    let enc = GzEncoder::new(archive_file, Compression::default());
    let mut tar_builder = Builder::new(enc);

    tar_builder
        .append_path_with_name(source_file, file_name)
        .with_context(|| format!("Failed to append file {} to archive", source_file.display()))?;

    let encoder = tar_builder.into_inner().with_context(|| {
        format!(
            "Failed to get inner encoder from tar builder for archive: {}",
            archive_dest_path.display()
        )
    })?;
    encoder.finish().with_context(|| {
        format!(
            "Failed to finish Gzip encoding for archive: {}",
            archive_dest_path.display()
        )
    })?;

    Ok(archive_dest_path.to_path_buf())
}

/// Extracts the single file held by an archive made with [`compress_file`].
///
/// Returns the path of the recovered file inside `extract_to_dir`.
pub fn extract_file(archive_path: &Path, extract_to_dir: &Path) -> Result<PathBuf> {
    if !archive_path.is_file() {
        return Err(anyhow::anyhow!(
            "Archive for extraction is not a file: {}",
            archive_path.display()
        ));
    }
    std::fs::create_dir_all(extract_to_dir).with_context(|| {
        format!(
            "Failed to create extraction directory: {}",
            extract_to_dir.display()
        )
    })?;

    let archive_file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive file: {}", archive_path.display()))?;
    let mut archive = Archive::new(GzDecoder::new(archive_file));

    let mut extracted: Option<PathBuf> = None;
    let entries = archive
        .entries()
        .with_context(|| format!("Failed to read archive {}", archive_path.display()))?;
    for entry in entries {
        let mut entry =
            entry.with_context(|| format!("Corrupt entry in archive {}", archive_path.display()))?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }
        let entry_path = entry.path()?.into_owned();
        let mut components = entry_path.components();
        let name = match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => name.to_os_string(),
            _ => anyhow::bail!(
                "Archive {} contains an unexpected path: {}",
                archive_path.display(),
                entry_path.display()
            ),
        };
        if extracted.is_some() {
            anyhow::bail!(
                "Archive {} holds more than one file",
                archive_path.display()
            );
        }
        let target = extract_to_dir.join(name);
        entry
            .unpack(&target)
            .with_context(|| format!("Failed to unpack {}", target.display()))?;
        extracted = Some(target);
    }

    extracted.with_context(|| format!("Archive {} is empty", archive_path.display()))
}

/// Hex-encoded SHA-256 of a file's contents.
pub fn file_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open {} for checksum", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
