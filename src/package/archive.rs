// Archive output for deployment packages.
//
// One writer/reader pair over the three output formats. Payload entries
// are already compressed (and possibly encrypted) by the builder, so
// archive members are always stored, never recompressed.

use crate::error::{EngineError, Result};
use crate::model::PackageFormat;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

pub enum ArchiveWriter {
    Zip(zip::ZipWriter<File>),
    Tar(tar::Builder<File>),
    Folder(PathBuf),
}

impl ArchiveWriter {
    /// Create a writer at `path`: a file for zip/tar, a directory root
    /// for the folder format.
    pub fn create(path: &Path, format: PackageFormat) -> Result<Self> {
        match format {
            PackageFormat::Zip => {
                let file = File::create(path)?;
                Ok(Self::Zip(zip::ZipWriter::new(file)))
            }
            PackageFormat::Tar => {
                let file = File::create(path)?;
                Ok(Self::Tar(tar::Builder::new(file)))
            }
            PackageFormat::Folder => {
                fs::create_dir_all(path)?;
                Ok(Self::Folder(path.to_path_buf()))
            }
        }
    }

    pub fn add_file(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        match self {
            Self::Zip(writer) => {
                let options =
                    SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
                writer
                    .start_file(name, options)
                    .map_err(|e| EngineError::Build(format!("zip entry '{}': {}", name, e)))?;
                writer.write_all(bytes)?;
            }
            Self::Tar(builder) => {
                let mut header = tar::Header::new_gnu();
                header.set_size(bytes.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, name, bytes)?;
            }
            Self::Folder(root) => {
                let path = root.join(name);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, bytes)?;
            }
        }
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        match self {
            Self::Zip(writer) => {
                writer
                    .finish()
                    .map_err(|e| EngineError::Build(format!("finalizing zip: {}", e)))?;
            }
            Self::Tar(builder) => {
                let mut file = builder.into_inner()?;
                file.flush()?;
            }
            Self::Folder(_) => {}
        }
        Ok(())
    }
}

/// Read every member of an archive into memory, keyed by entry name.
pub fn read_all(path: &Path, format: PackageFormat) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut entries = BTreeMap::new();
    match format {
        PackageFormat::Zip => {
            let file = File::open(path)?;
            let mut archive = zip::ZipArchive::new(file)
                .map_err(|e| EngineError::Build(format!("opening zip archive: {}", e)))?;
            for index in 0..archive.len() {
                let mut member = archive
                    .by_index(index)
                    .map_err(|e| EngineError::Build(format!("reading zip member: {}", e)))?;
                if member.is_dir() {
                    continue;
                }
                let name = member.name().to_string();
                let mut bytes = Vec::with_capacity(member.size() as usize);
                member.read_to_end(&mut bytes)?;
                entries.insert(name, bytes);
            }
        }
        PackageFormat::Tar => {
            let file = File::open(path)?;
            let mut archive = tar::Archive::new(file);
            for entry in archive.entries()? {
                let mut entry = entry?;
                if !entry.header().entry_type().is_file() {
                    continue;
                }
                let name = entry.path()?.to_string_lossy().replace('\\', "/");
                let mut bytes = Vec::new();
                entry.read_to_end(&mut bytes)?;
                entries.insert(name, bytes);
            }
        }
        PackageFormat::Folder => {
            for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(path)
                    .map_err(|e| EngineError::Build(format!("folder layout: {}", e)))?;
                let name = rel.to_string_lossy().replace('\\', "/");
                entries.insert(name, fs::read(entry.path())?);
            }
        }
    }
    Ok(entries)
}
