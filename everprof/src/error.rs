use std::io;

use everprof_events::{IpcError, RingBufferError};

/// How far an error reaches. `Error` is fatal to the enclosing operation
/// only, never to the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Notice,
    Warn,
    Error,
}

#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("perf_event_open failed: {0}")]
    PerfOpen(#[source] io::Error),
    #[error("ring buffer: {0}")]
    RingBuffer(#[from] RingBufferError),
    #[error("epoll: {0}")]
    Epoll(#[source] io::Error),
    #[error("handshake: {0}")]
    Ipc(#[from] IpcError),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("not a usable ELF file: {0}")]
    Elf(#[from] object::read::Error),
    #[error("no executable LOAD segment covers file offset {0:#x}")]
    NoLoadSegment(u64),
    #[error("module previously mapped at a different address")]
    InconsistentModule,
    #[error("file previously failed to open or parse")]
    ErroredFile,
    #[error("no mapping contains this address")]
    UnknownDso,
    #[error("profile serialization failed: {0}")]
    Export(#[source] io::Error),
}

/// The `{severity, kind}` pair every component surface returns.
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct ProfilerError {
    pub severity: Severity,
    #[source]
    pub kind: ErrorKind,
}

impl ProfilerError {
    pub fn error(kind: ErrorKind) -> Self {
        ProfilerError {
            severity: Severity::Error,
            kind,
        }
    }

    pub fn warn(kind: ErrorKind) -> Self {
        ProfilerError {
            severity: Severity::Warn,
            kind,
        }
    }

    pub fn notice(kind: ErrorKind) -> Self {
        ProfilerError {
            severity: Severity::Notice,
            kind,
        }
    }

    /// Route to the log backend according to severity.
    pub fn log(&self) {
        match self.severity {
            Severity::Error => log::error!("{self}"),
            Severity::Warn => log::warn!("{self}"),
            Severity::Notice => log::debug!("{self}"),
        }
    }
}

impl From<ErrorKind> for ProfilerError {
    fn from(kind: ErrorKind) -> Self {
        ProfilerError::error(kind)
    }
}

impl From<io::Error> for ProfilerError {
    fn from(err: io::Error) -> Self {
        ProfilerError::error(ErrorKind::Io(err))
    }
}

impl From<RingBufferError> for ProfilerError {
    fn from(err: RingBufferError) -> Self {
        ProfilerError::error(ErrorKind::RingBuffer(err))
    }
}

impl From<IpcError> for ProfilerError {
    fn from(err: IpcError) -> Self {
        ProfilerError::error(ErrorKind::Ipc(err))
    }
}

impl From<object::read::Error> for ProfilerError {
    fn from(err: object::read::Error) -> Self {
        ProfilerError::error(ErrorKind::Elf(err))
    }
}

pub type Result<T> = std::result::Result<T, ProfilerError>;
