use thiserror::Error;

/// Errors that travel to a recovery point.
///
/// These are the only errors ordinary callers observe. Contract violations
/// are panics and never show up here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("out of memory: requested {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("stack overflow")]
    StackOverflow,
    #[error("interrupted: {0}")]
    Interrupted(&'static str),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("{field} must be > 0")]
    Zero { field: &'static str },
    #[error("{field} must be a multiple of the OS page size")]
    Unaligned { field: &'static str },
    #[error("store buffer threshold ({threshold}) must be >= block size ({block_size})")]
    ThresholdBelowBlock { threshold: usize, block_size: usize },
}
