//! Scratch files and per-run tar archives holding computed results.

use crate::dataset::DataArray;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

pub const ARCHIVE_FILE_NAME: &str = "data.tar";
pub const ARTIFACT_EXTENSION: &str = "json";

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("Archive {archive} has no entry '{entry}'")]
    MissingEntry { archive: PathBuf, entry: String },

    #[error("Cannot decode {path}: {source}")]
    Codec {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Cannot merge a {new} result into a stored {stored} result")]
    KindMismatch {
        stored: &'static str,
        new: &'static str,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One saved result: a field, or one field per region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Artifact {
    Field(DataArray),
    Regional(BTreeMap<String, DataArray>),
}

impl Artifact {
    fn kind_name(&self) -> &'static str {
        match self {
            Artifact::Field(_) => "field",
            Artifact::Regional(_) => "regional",
        }
    }

    pub fn as_field(&self) -> Option<&DataArray> {
        match self {
            Artifact::Field(f) => Some(f),
            Artifact::Regional(_) => None,
        }
    }

    pub fn region(&self, name: &str) -> Option<&DataArray> {
        match self {
            Artifact::Regional(r) => r.get(name),
            Artifact::Field(_) => None,
        }
    }

    pub fn map<F: Fn(&DataArray) -> DataArray>(&self, f: F) -> Artifact {
        match self {
            Artifact::Field(a) => Artifact::Field(f(a)),
            Artifact::Regional(r) => {
                Artifact::Regional(r.iter().map(|(k, v)| (k.clone(), f(v))).collect())
            }
        }
    }

    /// Regional results gain the new regions and keep the rest; fields are replaced.
    pub fn merge(self, new: Artifact) -> Result<Artifact, PersistenceError> {
        match (self, new) {
            (Artifact::Regional(mut stored), Artifact::Regional(new)) => {
                stored.extend(new);
                Ok(Artifact::Regional(stored))
            }
            (Artifact::Field(_), Artifact::Field(new)) => Ok(Artifact::Field(new)),
            (stored, new) => Err(PersistenceError::KindMismatch {
                stored: stored.kind_name(),
                new: new.kind_name(),
            }),
        }
    }
}

/// Where the results of one Calc live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub dir_scratch: PathBuf,
    pub dir_archive: PathBuf,
    /// File name per output kind label
    pub file_names: BTreeMap<String, String>,
}

impl ArtifactPaths {
    pub fn file_name(&self, kind: &str) -> Option<&str> {
        self.file_names.get(kind).map(String::as_str)
    }

    pub fn path_scratch(&self, kind: &str) -> Option<PathBuf> {
        self.file_name(kind).map(|f| self.dir_scratch.join(f))
    }

    pub fn path_archive(&self) -> PathBuf {
        self.dir_archive.join(ARCHIVE_FILE_NAME)
    }
}

pub fn read_artifact(path: &Path) -> Result<Artifact, PersistenceError> {
    let file = File::open(path).map_err(io_err(path))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| PersistenceError::Codec {
        path: path.to_path_buf(),
        source,
    })
}

/// Write atomically: a temporary file in the same directory is renamed into place.
fn write_atomic<F>(path: &Path, write: F) -> Result<(), PersistenceError>
where
    F: FnOnce(&mut BufWriter<&mut NamedTempFile>) -> Result<(), PersistenceError>,
{
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(io_err(dir))?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err(dir))?;
    {
        let mut writer = BufWriter::new(&mut tmp);
        write(&mut writer)?;
        writer.flush().map_err(io_err(path))?;
    }
    tmp.persist(path).map_err(|e| PersistenceError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

/// Save to scratch, merging regional results with any already on disk.
///
/// # Returns
/// The artifact as written
pub fn save_to_scratch(path: &Path, artifact: Artifact) -> Result<Artifact, PersistenceError> {
    let artifact = match (&artifact, path.is_file()) {
        (Artifact::Regional(_), true) => read_artifact(path)?.merge(artifact)?,
        _ => artifact,
    };
    write_atomic(path, |w| {
        serde_json::to_writer(w, &artifact).map_err(|source| PersistenceError::Codec {
            path: path.to_path_buf(),
            source,
        })
    })?;
    debug!("Wrote {}", path.display());
    Ok(artifact)
}

/// Replace entry `entry` of the tar at `archive` with the contents of `source`.
///
/// The archive is rewritten without the old entry and the new one appended.
pub fn save_to_archive(archive: &Path, entry: &str, source: &Path) -> Result<(), PersistenceError> {
    let mut kept: Vec<(tar::Header, PathBuf, Vec<u8>)> = Vec::new();
    if archive.is_file() {
        let file = File::open(archive).map_err(io_err(archive))?;
        let mut tar = tar::Archive::new(BufReader::new(file));
        for item in tar.entries().map_err(io_err(archive))? {
            let mut item = item.map_err(io_err(archive))?;
            let name = item.path().map_err(io_err(archive))?.into_owned();
            if name.as_path() == Path::new(entry) {
                debug!("Replacing '{}' in {}", entry, archive.display());
                continue;
            }
            let mut data = Vec::new();
            item.read_to_end(&mut data).map_err(io_err(archive))?;
            kept.push((item.header().clone(), name, data));
        }
    }

    write_atomic(archive, |w| {
        let mut builder = tar::Builder::new(w);
        for (mut header, name, data) in kept {
            builder
                .append_data(&mut header, &name, data.as_slice())
                .map_err(io_err(archive))?;
        }
        builder
            .append_path_with_name(source, entry)
            .map_err(io_err(source))?;
        builder.finish().map_err(io_err(archive))
    })
}

pub fn load_from_archive(archive: &Path, entry: &str) -> Result<Artifact, PersistenceError> {
    let file = File::open(archive).map_err(io_err(archive))?;
    let mut tar = tar::Archive::new(BufReader::new(file));
    for item in tar.entries().map_err(io_err(archive))? {
        let item = item.map_err(io_err(archive))?;
        let found = *item.path().map_err(io_err(archive))? == *Path::new(entry);
        if found {
            return serde_json::from_reader(item).map_err(|source| PersistenceError::Codec {
                path: archive.join(entry),
                source,
            });
        }
    }
    Err(PersistenceError::MissingEntry {
        archive: archive.to_path_buf(),
        entry: entry.to_string(),
    })
}

/// Names of the entries in an archive, in order
pub fn archive_entries(archive: &Path) -> Result<Vec<String>, PersistenceError> {
    let file = File::open(archive).map_err(io_err(archive))?;
    let mut tar = tar::Archive::new(BufReader::new(file));
    let mut names = Vec::new();
    for item in tar.entries().map_err(io_err(archive))? {
        let item = item.map_err(io_err(archive))?;
        names.push(item.path().map_err(io_err(archive))?.display().to_string());
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn field(name: &str, value: f64) -> DataArray {
        DataArray::from_vec(name, "lat", vec![value, value])
    }

    #[test]
    fn test_regional_merge_keeps_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub").join("x.json");

        let first = Artifact::Regional(BTreeMap::from([("nh".to_string(), field("x", 1.0))]));
        save_to_scratch(&path, first).unwrap();
        let second = Artifact::Regional(BTreeMap::from([("sh".to_string(), field("x", 2.0))]));
        let merged = save_to_scratch(&path, second).unwrap();

        let on_disk = read_artifact(&path).unwrap();
        assert_eq!(merged, on_disk);
        assert!(on_disk.region("nh").is_some());
        assert!(on_disk.region("sh").is_some());
    }

    #[test]
    fn test_field_overwrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.json");
        save_to_scratch(&path, Artifact::Field(field("x", 1.0))).unwrap();
        save_to_scratch(&path, Artifact::Field(field("x", 2.0))).unwrap();
        assert_eq!(read_artifact(&path).unwrap(), Artifact::Field(field("x", 2.0)));
    }

    #[test]
    fn test_kind_mismatch() {
        let stored = Artifact::Field(field("x", 1.0));
        let new = Artifact::Regional(BTreeMap::new());
        assert!(matches!(stored.merge(new), Err(PersistenceError::KindMismatch { .. })));
    }

    #[test]
    fn test_archive_replaces_entry() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("archive").join(ARCHIVE_FILE_NAME);
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        save_to_scratch(&a, Artifact::Field(field("x", 1.0))).unwrap();
        save_to_scratch(&b, Artifact::Field(field("y", 5.0))).unwrap();

        save_to_archive(&archive, "a.json", &a).unwrap();
        save_to_archive(&archive, "b.json", &b).unwrap();
        save_to_scratch(&a, Artifact::Field(field("x", 3.0))).unwrap();
        save_to_archive(&archive, "a.json", &a).unwrap();

        assert_eq!(archive_entries(&archive).unwrap(), vec!["b.json", "a.json"]);
        assert_eq!(
            load_from_archive(&archive, "a.json").unwrap(),
            Artifact::Field(field("x", 3.0))
        );
        assert_eq!(
            load_from_archive(&archive, "b.json").unwrap(),
            Artifact::Field(field("y", 5.0))
        );
        assert!(matches!(
            load_from_archive(&archive, "c.json"),
            Err(PersistenceError::MissingEntry { .. })
        ));
    }
}
