//! Image file placement: temporary staging, plate-keyed archive, discard.
//!
//! An image lives in exactly one place at a time. Archiving renames the staged
//! file; when a rename is impossible the copy is completed before the staged
//! file is removed, and a copy that cannot be finalized is rolled back.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::IngestError;
use crate::{Image, UNKNOWN_PLATE};

const IMAGE_EXTENSION: &str = "jpg";
const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Clone, Debug)]
pub struct ImageStore {
    temp_dir: PathBuf,
    archive_dir: PathBuf,
}

impl ImageStore {
    pub fn new(temp_dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Result<Self> {
        let temp_dir = temp_dir.into();
        let archive_dir = archive_dir.into();
        fs::create_dir_all(&temp_dir)
            .with_context(|| format!("create temp dir {}", temp_dir.display()))?;
        fs::create_dir_all(&archive_dir)
            .with_context(|| format!("create archive dir {}", archive_dir.display()))?;
        Ok(Self {
            temp_dir,
            archive_dir,
        })
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Write the image to temporary storage as `temp_<timestamp>.jpg`.
    pub fn stage(&self, image: &Image) -> Result<PathBuf, IngestError> {
        let stem = format!("temp_{}", image.timestamp_tag());
        write_unique(&self.temp_dir, &stem, image.bytes()).map_err(|source| {
            IngestError::Staging {
                path: self.temp_dir.join(format!("{}.{}", stem, IMAGE_EXTENSION)),
                source,
            }
        })
    }

    /// Move a staged image into the archive as `<plate>_<timestamp>.jpg`.
    ///
    /// On error the image is still at `staged`.
    pub fn archive(&self, staged: &Path, plate: &str, timestamp_tag: &str) -> Result<PathBuf, IngestError> {
        let stem = format!("{}_{}", sanitize_plate(plate), timestamp_tag);
        let (target, placeholder) =
            reserve_unique(&self.archive_dir, &stem).map_err(|source| IngestError::Placement {
                from: staged.to_path_buf(),
                to: self.archive_dir.join(format!("{}.{}", stem, IMAGE_EXTENSION)),
                source,
            })?;
        drop(placeholder);

        let placement_error = |source: io::Error| IngestError::Placement {
            from: staged.to_path_buf(),
            to: target.clone(),
            source,
        };

        match fs::rename(staged, &target) {
            Ok(()) => return Ok(target),
            Err(err) => log::debug!(
                "rename {} -> {} failed ({}); copying instead",
                staged.display(),
                target.display(),
                err
            ),
        }

        copy_then_remove(staged, &target, |p: &Path| fs::remove_file(p))
            .map_err(placement_error)?;
        Ok(target)
    }

    /// Remove a staged image.
    pub fn discard(&self, staged: &Path) -> io::Result<()> {
        match fs::remove_file(staged) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Make a plate value safe to embed in a file name.
pub fn sanitize_plate(plate: &str) -> String {
    let cleaned: String = plate
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        UNKNOWN_PLATE.to_string()
    } else {
        cleaned
    }
}

/// Write `bytes` to `<dir>/<stem>.jpg`, adding `_<n>` if the name is taken.
/// A file that fails mid-write is removed.
pub fn write_unique(dir: &Path, stem: &str, bytes: &[u8]) -> io::Result<PathBuf> {
    let (path, mut file) = reserve_unique(dir, stem)?;
    let written = file.write_all(bytes).and_then(|_| file.sync_all());
    if let Err(err) = written {
        drop(file);
        let _ = fs::remove_file(&path);
        return Err(err);
    }
    Ok(path)
}

/// Copy `staged` to `target`, then remove `staged` with `remove_staged`. On
/// any failure `target` is removed again so the image stays only at `staged`.
fn copy_then_remove<F>(staged: &Path, target: &Path, remove_staged: F) -> io::Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    if let Err(err) = fs::copy(staged, target) {
        let _ = fs::remove_file(target);
        return Err(err);
    }
    if let Err(err) = remove_staged(staged) {
        if let Err(cleanup) = fs::remove_file(target) {
            log::error!(
                "image now present in both {} and {}: {}",
                staged.display(),
                target.display(),
                cleanup
            );
        }
        return Err(err);
    }
    Ok(())
}

fn reserve_unique(dir: &Path, stem: &str) -> io::Result<(PathBuf, File)> {
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = if attempt == 0 {
            format!("{}.{}", stem, IMAGE_EXTENSION)
        } else {
            format!("{}_{}.{}", stem, attempt, IMAGE_EXTENSION)
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free file name for {} in {}", stem, dir.display()),
    ))
}
