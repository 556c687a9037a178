//! Source Archives
//!
//! Format sniffing, safe extraction and packing of source trees.

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    Zip,

    #[serde(rename = "tar.gz")]
    TarGz,

    Tar,
}

impl ArchiveFormat {
    /// Sniff the format from magic bytes.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"PK\x03\x04") || bytes.starts_with(b"PK\x05\x06") {
            Some(ArchiveFormat::Zip)
        } else if bytes.starts_with(&[0x1f, 0x8b]) {
            Some(ArchiveFormat::TarGz)
        } else if bytes.len() > 262 && &bytes[257..262] == b"ustar" {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::Tar => "tar",
        }
    }
}

/// Extract `bytes` into `dest`, returning the number of entries written.
pub fn unpack(bytes: &[u8], dest: &Path) -> Result<usize> {
    let format = ArchiveFormat::detect(bytes)
        .ok_or_else(|| Error::other("unrecognised archive format"))?;
    unpack_as(format, bytes, dest)
}

pub fn unpack_as(format: ArchiveFormat, bytes: &[u8], dest: &Path) -> Result<usize> {
    std::fs::create_dir_all(dest)?;
    let count = match format {
        ArchiveFormat::Zip => unpack_zip(bytes, dest)?,
        ArchiveFormat::TarGz => unpack_tar(GzDecoder::new(bytes), dest)?,
        ArchiveFormat::Tar => unpack_tar(bytes, dest)?,
    };
    if count == 0 {
        return Err(Error::other("archive is empty"));
    }
    Ok(count)
}

/// Extract and descend into the single top-level folder hosted archives wrap
/// their contents in.
pub fn unpack_stripped(bytes: &[u8], dest: &Path) -> Result<PathBuf> {
    unpack(bytes, dest)?;
    single_root(dest)
}

fn single_root(dest: &Path) -> Result<PathBuf> {
    let mut entries = std::fs::read_dir(dest)?.collect::<std::io::Result<Vec<_>>>()?;
    if entries.len() == 1 && entries[0].file_type()?.is_dir() {
        if let Some(entry) = entries.pop() {
            return Ok(entry.path());
        }
    }
    Ok(dest.to_path_buf())
}

fn check_entry_path(path: &Path) -> Result<()> {
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(Error::other(format!(
            "archive entry escapes destination: {}",
            path.display()
        )));
    }
    Ok(())
}

fn unpack_tar<R: Read>(reader: R, dest: &Path) -> Result<usize> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);

    let mut count = 0;
    for entry in archive
        .entries()
        .map_err(|e| Error::other(format!("corrupt tar archive: {}", e)))?
    {
        let mut entry = entry.map_err(|e| Error::other(format!("corrupt tar archive: {}", e)))?;
        let kind = entry.header().entry_type();
        if kind.is_pax_global_extensions() || kind.is_pax_local_extensions() {
            continue;
        }
        let path = entry.path()?.into_owned();
        check_entry_path(&path)?;
        entry.unpack_in(dest)?;
        count += 1;
    }
    Ok(count)
}

fn unpack_zip(bytes: &[u8], dest: &Path) -> Result<usize> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| Error::other(format!("corrupt zip archive: {}", e)))?;

    for index in 0..archive.len() {
        let mut file = archive
            .by_index(index)
            .map_err(|e| Error::other(format!("corrupt zip archive: {}", e)))?;
        let Some(relative) = file.enclosed_name() else {
            return Err(Error::other(format!(
                "archive entry escapes destination: {}",
                file.name()
            )));
        };
        let target = dest.join(relative);

        if file.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut file, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(archive.len())
}

/// Tar up a directory tree, skipping `.git`.
pub fn pack_dir(dir: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    append_dir(&mut builder, dir, Path::new(""))?;
    Ok(builder.into_inner()?)
}

fn append_dir(builder: &mut tar::Builder<Vec<u8>>, root: &Path, relative: &Path) -> Result<()> {
    let mut entries = std::fs::read_dir(root.join(relative))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        if entry.file_name() == ".git" {
            continue;
        }
        let name = relative.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            builder.append_dir(&name, entry.path())?;
            append_dir(builder, root, &name)?;
        } else {
            builder.append_path_with_name(entry.path(), &name)?;
        }
    }
    Ok(())
}
