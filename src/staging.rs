//! Prefetch hook for files kept on tape-backed or otherwise slow storage.

use log::debug;
use std::io;
use std::path::PathBuf;
use std::process::Command;

/// Make files available locally before they are read.
///
/// Staging must be idempotent: staging an already-local file is a no-op.
pub trait Stager: Send + Sync + std::fmt::Debug {
    fn stage(&self, paths: &[PathBuf]) -> io::Result<()>;
}

/// Files are always local.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStaging;

impl Stager for NoStaging {
    fn stage(&self, _paths: &[PathBuf]) -> io::Result<()> {
        Ok(())
    }
}

/// Run an external retrieval command (e.g. `dmget`) with the paths appended.
#[derive(Debug, Clone)]
pub struct CommandStager {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandStager {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
        }
    }
}

impl Stager for CommandStager {
    fn stage(&self, paths: &[PathBuf]) -> io::Result<()> {
        let existing: Vec<&PathBuf> = paths.iter().filter(|p| p.exists()).collect();
        if existing.is_empty() {
            return Ok(());
        }
        debug!("Staging {} files with {}", existing.len(), self.program);
        let status = Command::new(&self.program)
            .args(&self.args)
            .args(&existing)
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} exited with {}", self.program, status),
            ))
        }
    }
}
