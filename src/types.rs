/// Core result and error types for the appbox launcher
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the launcher and its subsystems.
///
/// Only three conditions are recovered locally instead of unwinding through
/// here: a seccomp architecture that was already added, an unreachable
/// portal/a11y service, and an unavailable systemd user session. Everything
/// else aborts the launch.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{op} failed for {}: {source}", path.display())]
    File {
        op: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Deploy error: {0}")]
    Deploy(String),

    #[error("Bus proxy error: {0}")]
    Proxy(String),

    #[error("Bus proxy did not signal readiness within {0} seconds")]
    ProxyTimeout(u64),

    #[error("ld.so cache error: {0}")]
    LdCache(String),

    #[error("Seccomp filter error: {0}")]
    Seccomp(String),

    #[error("Sandbox executor error: {0}")]
    Sandbox(String),
}

impl LaunchError {
    /// Wrap an io::Error with the operation and path it came from.
    pub fn file(op: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| LaunchError::File { op, path, source }
    }
}

impl From<nix::errno::Errno> for LaunchError {
    fn from(err: nix::errno::Errno) -> Self {
        LaunchError::Io(std::io::Error::from_raw_os_error(err as i32))
    }
}

/// Result type alias for launcher operations
pub type Result<T> = std::result::Result<T, LaunchError>;
