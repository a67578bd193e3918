/// Append-only executor argument stream plus the list of file descriptors
/// that must survive into the child.
///
/// All content destined for the sandbox flows through kernel-anonymous fds
/// rather than filesystem paths, so there is no window where a host-visible
/// temp file could be swapped out under the child.
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;

use memfd::{FileSeal, MemfdOptions};

use crate::types::{LaunchError, Result};

/// Materialize `content` into an anonymous sealed memory file. When sealing
/// is unavailable the fallback is an unlinked temp file, which the child
/// cannot re-link either. The returned fd is positioned at offset zero.
pub fn seal_data(name: &str, content: &[u8]) -> Result<OwnedFd> {
    match MemfdOptions::default().allow_sealing(true).create(name) {
        Ok(mfd) => {
            {
                let mut file = mfd.as_file();
                file.write_all(content)?;
                file.rewind()?;
            }
            for seal in [
                FileSeal::SealShrink,
                FileSeal::SealGrow,
                FileSeal::SealWrite,
                FileSeal::SealSeal,
            ] {
                mfd.add_seal(seal)
                    .map_err(|e| LaunchError::Sandbox(format!("sealing {name}: {e}")))?;
            }
            Ok(mfd.into_file().into())
        }
        Err(e) => {
            log::debug!("memfd_create unavailable for {name} ({e}), using unlinked temp file");
            let mut file = tempfile::tempfile()?;
            file.write_all(content)?;
            file.rewind()?;
            Ok(file.into())
        }
    }
}

/// Read back the full contents of a data fd without moving its offset for
/// the child (the fd is rewound afterwards). Mostly useful in tests.
pub fn read_back(fd: &OwnedFd) -> Result<Vec<u8>> {
    // The dup shares the file offset, so rewinding it rewinds the original.
    let mut file = File::from(fd.try_clone()?);
    file.rewind()?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    file.rewind()?;
    Ok(buf)
}

#[derive(Debug, Default)]
pub struct ArgStream {
    args: Vec<OsString>,
    fds: Vec<OwnedFd>,
}

impl ArgStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one argument. Chainable like Command::arg.
    pub fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several same-typed arguments.
    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg);
        }
        self
    }

    /// Append `op <fd>`; ownership of the fd moves to the stream and the
    /// fd number is written as the next argument.
    pub fn arg_fd(&mut self, op: &str, fd: OwnedFd) -> &mut Self {
        self.arg(op);
        self.arg(fd.as_raw_fd().to_string());
        self.fds.push(fd);
        self
    }

    /// Append `op <fd> <path>` for ops that bind fd contents at a sandbox
    /// path.
    pub fn arg_fd_path(&mut self, op: &str, fd: OwnedFd, path: impl AsRef<OsStr>) -> &mut Self {
        self.arg(op);
        self.arg(fd.as_raw_fd().to_string());
        self.arg(path);
        self.fds.push(fd);
        self
    }

    /// Seal `content` into an anonymous fd and emit a
    /// `--bind-data <fd> <path>` triple.
    pub fn add_data(&mut self, name: &str, content: &[u8], path: impl AsRef<OsStr>) -> Result<()> {
        let fd = seal_data(name, content)?;
        self.arg_fd_path("--bind-data", fd, path);
        Ok(())
    }

    /// Same as add_data but read-only inside the sandbox.
    pub fn add_data_ro(&mut self, name: &str, content: &[u8], path: impl AsRef<OsStr>) -> Result<()> {
        let fd = seal_data(name, content)?;
        self.arg_fd_path("--ro-bind-data", fd, path);
        Ok(())
    }

    /// Append every argument of `other` and take over its fds.
    pub fn append(&mut self, other: ArgStream) {
        self.args.extend(other.args);
        self.fds.extend(other.fds);
    }

    pub fn args_list(&self) -> &[OsString] {
        &self.args
    }

    pub fn fds_list(&self) -> &[OwnedFd] {
        &self.fds
    }

    pub fn take_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.fds)
    }

    /// Push another owned fd that must survive exec without emitting any
    /// argument for it.
    pub fn hold_fd(&mut self, fd: OwnedFd) {
        self.fds.push(fd);
    }

    /// NUL-terminated concatenation of all arguments, the wire format of
    /// the executor's `--args` fd.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for arg in &self.args {
            out.extend_from_slice(arg.as_bytes());
            out.push(0);
        }
        out
    }

    /// Serialize the stream into a sealed fd suitable for `--args`.
    pub fn serialized_args_fd(&self) -> Result<OwnedFd> {
        seal_data("executor-args", &self.to_bytes())
    }

    /// Lossy UTF-8 view of the arguments, for logging and tests.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// True if the rendered argument list contains `needle` anywhere.
    pub fn contains_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a == OsStr::new(needle))
    }
}

/// Clear close-on-exec on every fd in the list. Called in the child setup
/// hook (or directly before a process-image-replacing exec): these are
/// exactly the fds the executor expects to inherit.
pub fn clear_cloexec(fds: &[OwnedFd]) -> Result<()> {
    for fd in fds {
        let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, 0) };
        if rc != 0 {
            return Err(LaunchError::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}
