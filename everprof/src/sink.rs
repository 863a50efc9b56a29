use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use crate::error::{ErrorKind, ProfilerError, Result};

/// Where serialized profiles go at the end of each cycle. The real HTTP
/// exporter lives behind this seam.
pub trait ProfileSink {
    fn export(&mut self, serialized: &[u8]) -> Result<()>;
}

/// Writes `profile_<seq>.pb` files into a directory.
pub struct FileSink {
    directory: PathBuf,
    sequence: u64,
}

impl FileSink {
    pub fn new(directory: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&directory)
            .map_err(|e| ProfilerError::error(ErrorKind::Export(e)))?;
        Ok(FileSink {
            directory,
            sequence: 0,
        })
    }
}

impl ProfileSink for FileSink {
    fn export(&mut self, serialized: &[u8]) -> Result<()> {
        let path = self.directory.join(format!("profile_{}.pb", self.sequence));
        self.sequence += 1;
        let mut file =
            File::create(&path).map_err(|e| ProfilerError::error(ErrorKind::Export(e)))?;
        file.write_all(serialized)
            .map_err(|e| ProfilerError::error(ErrorKind::Export(e)))?;
        log::info!("wrote {} bytes to {}", serialized.len(), path.display());
        Ok(())
    }
}

/// Swallows profiles; used when only the side effects of profiling matter.
#[derive(Default)]
pub struct DiscardSink {
    pub exported: u64,
}

impl ProfileSink for DiscardSink {
    fn export(&mut self, serialized: &[u8]) -> Result<()> {
        log::debug!("discarding {} profile bytes", serialized.len());
        self.exported += 1;
        Ok(())
    }
}
