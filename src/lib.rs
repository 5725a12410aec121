pub mod config;
pub mod consumer;
pub mod ebpf;
pub mod error;
#[cfg(unix)]
pub mod shutdown;

pub use error::{Result, RqtapError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
