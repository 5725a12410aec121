use thiserror::Error;

#[derive(Error, Debug)]
pub enum RqtapError {
    #[error("Failed to open and verify eBPF program: {reason}")]
    Load { reason: String, errno: Option<i32> },

    #[error("Failed to attach kprobe to {hook}: {reason}")]
    Attach {
        hook: String,
        reason: String,
        errno: Option<i32>,
    },

    #[error("Failed to create ring buffer: {0}")]
    Channel(String),

    #[error("Error polling ring buffer: {0}")]
    Poll(#[source] std::io::Error),

    #[error("Failed to raise RLIMIT_MEMLOCK: {0}")]
    ResourceLimit(#[source] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Failed to install signal handlers: {0}")]
    Signal(#[source] std::io::Error),

    #[error("Pre-flight check failed: {0}")]
    Preflight(String),

    #[error("Kernel version {version} is too old. Minimum required: {min_version}")]
    KernelVersionTooOld {
        version: String,
        min_version: String,
    },
}

impl RqtapError {
    pub fn load(reason: impl Into<String>) -> Self {
        RqtapError::Load {
            reason: reason.into(),
            errno: None,
        }
    }

    /// Process exit code for this error: the magnitude of the OS error code
    /// when one is known, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        let errno = match self {
            RqtapError::Poll(e) | RqtapError::ResourceLimit(e) | RqtapError::Signal(e) => {
                e.raw_os_error()
            }
            RqtapError::Load { errno, .. } | RqtapError::Attach { errno, .. } => *errno,
            _ => None,
        };

        match errno.map(i32::saturating_abs) {
            Some(code) if code != 0 => code,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, RqtapError>;
