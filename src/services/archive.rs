use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, Header};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::models::image::{FileOperation, FileOperationKind};

/// Relative path (with `/` separators) to gzipped content.
pub(crate) type GzipFileMap = BTreeMap<String, Vec<u8>>;

pub(crate) fn gzip_bytes(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub(crate) fn gunzip_bytes(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut output = Vec::new();
    decoder.read_to_end(&mut output)?;
    Ok(output)
}

/// Every regular file under `dir`, gzipped in memory.
pub(crate) fn gzip_dir(dir: &Path) -> anyhow::Result<GzipFileMap> {
    let mut files = GzipFileMap::new();
    if !dir.exists() {
        return Ok(files);
    }

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = relative_name(dir, entry.path())?;
        let data = fs::read(entry.path())
            .with_context(|| format!("failed to read {}", entry.path().display()))?;
        files.insert(relative, gzip_bytes(&data)?);
    }

    Ok(files)
}

/// Inverse of [`gzip_dir`].
pub(crate) fn write_gzip_files(files: &GzipFileMap, dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    for (name, data) in files {
        let path = safe_join(dir, name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = gunzip_bytes(data).with_context(|| format!("file '{name}' is not gzipped"))?;
        fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))?;
    }

    Ok(())
}

/// A `.tar.gz` of the map, for handing a submission back to a client.
pub(crate) fn tar_gz_files(files: &GzipFileMap) -> anyhow::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);

    for (name, data) in files {
        let content = gunzip_bytes(data)?;
        let mut header = Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, content.as_slice())?;
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

pub(crate) fn untar_gz(data: &[u8], dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dir)?;

    let mut archive = Archive::new(GzDecoder::new(Cursor::new(data)));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();
        let path = safe_join(dir, &name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&path)?;
    }

    Ok(())
}

/// Extract an uploaded `.zip`, `.tar.gz` or `.tgz` into `dir`.
pub(crate) fn extract_archive(name: &str, data: &[u8], dir: &Path) -> anyhow::Result<()> {
    let lower = name.to_lowercase();
    if lower.ends_with(".zip") {
        let mut archive = ZipArchive::new(Cursor::new(data))?;
        for index in 0..archive.len() {
            let mut file = archive.by_index(index)?;
            let path = safe_join(dir, file.name())?;
            if file.is_dir() {
                fs::create_dir_all(&path)?;
                continue;
            }

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut output = File::create(&path)?;
            io::copy(&mut file, &mut output)?;
        }
        Ok(())
    } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        untar_gz(data, dir)
    } else {
        bail!("unsupported archive type: '{name}'")
    }
}

pub(crate) fn is_archive_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.ends_with(".zip") || lower.ends_with(".tar.gz") || lower.ends_with(".tgz")
}

/// Zip `dir` into `dest`. Entries are relative to `dir`.
pub(crate) fn zip_dir(dir: &Path, dest: &Path) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = File::create(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if entry.path() == dir {
            continue;
        }

        let name = relative_name(dir, entry.path())?;
        if entry.file_type().is_dir() {
            zip.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options)?;
            let mut source = File::open(entry.path())?;
            io::copy(&mut source, &mut zip)?;
        }
    }

    zip.finish()?;
    Ok(())
}

pub(crate) fn copy_dir(source: &Path, dest: &Path) -> anyhow::Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(source)?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)
                .with_context(|| format!("failed to copy {}", entry.path().display()))?;
        }
    }

    Ok(())
}

/// Copy a file or a directory tree.
pub(crate) fn copy_path(source: &Path, dest: &Path) -> anyhow::Result<()> {
    if source.is_dir() {
        return copy_dir(source, dest);
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, dest).with_context(|| format!("failed to copy {}", source.display()))?;
    Ok(())
}

/// Run file operations with every path taken relative to `base`.
pub(crate) fn apply_file_ops(base: &Path, operations: &[FileOperation]) -> anyhow::Result<()> {
    for operation in operations {
        apply_file_op(base, operation).with_context(|| format!("file operation '{operation}' failed"))?;
    }

    Ok(())
}

fn apply_file_op(base: &Path, operation: &FileOperation) -> anyhow::Result<()> {
    operation.validate()?;
    let args = operation.args();

    let Some(kind) = operation.kind() else {
        bail!("unknown file operation");
    };

    match kind {
        FileOperationKind::Copy => {
            copy_path(&safe_join(base, &args[0])?, &safe_join(base, &args[1])?)?;
        }
        FileOperationKind::Move => {
            let dest = safe_join(base, &args[1])?;
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(safe_join(base, &args[0])?, dest)?;
        }
        FileOperationKind::MakeDir => {
            fs::create_dir_all(safe_join(base, &args[0])?)?;
        }
        FileOperationKind::Remove => {
            let path = safe_join(base, &args[0])?;
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else if path.exists() {
                fs::remove_file(&path)?;
            }
        }
    }

    Ok(())
}

/// Join a relative name under `base`, refusing anything that would escape it.
pub(crate) fn safe_join(base: &Path, name: &str) -> anyhow::Result<PathBuf> {
    let relative = Path::new(name);
    let escapes = relative.components().any(|component| {
        matches!(component, Component::ParentDir | Component::RootDir | Component::Prefix(_))
    });

    if escapes || name.trim().is_empty() {
        bail!("path '{name}' is not a relative path inside its base dir");
    }

    Ok(base.join(relative))
}

fn relative_name(base: &Path, path: &Path) -> anyhow::Result<String> {
    let relative = path.strip_prefix(base)?;
    let parts: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().to_string())
        .collect();
    Ok(parts.join("/"))
}
