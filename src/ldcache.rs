/// Content-addressed regeneration of the dynamic-linker cache. The cache
/// key covers everything that can change the library search result: the
/// app and runtime commits plus both extension summaries.
use std::collections::BTreeMap;
use std::fs;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use sha2::{Digest, Sha256};

use crate::argstream::ArgStream;
use crate::blobs::LD_SO_CONF;
use crate::types::{LaunchError, Result};

const SANDBOX_CACHE_DIR: &str = "/run/ld-so-cache-dir";

/// SHA-256 over (app commit, runtime commit, app extensions, runtime
/// extensions), in that order.
pub fn cache_key(
    app_commit: Option<&str>,
    runtime_commit: &str,
    app_extensions: &str,
    runtime_extensions: &str,
) -> String {
    let mut hasher = Sha256::new();
    if let Some(commit) = app_commit {
        hasher.update(commit.as_bytes());
    }
    hasher.update(runtime_commit.as_bytes());
    if !app_extensions.is_empty() {
        hasher.update(app_extensions.as_bytes());
    }
    if !runtime_extensions.is_empty() {
        hasher.update(runtime_extensions.as_bytes());
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Emit the generated /etc/ld.so.conf. Used both for the regeneration
/// sandbox and the final one when the runtime ships an empty conf.
pub fn add_ld_so_conf(stream: &mut ArgStream) -> Result<()> {
    stream.add_data("ld-so-conf", LD_SO_CONF.as_bytes(), "/etc/ld.so.conf")
}

pub struct LdCacheConfig<'a> {
    pub app_id_dir: Option<&'a Path>,
    pub generate_ld_so_conf: bool,
    pub executor: &'a Path,
    /// Minimal environment for the ldconfig run.
    pub env: &'a BTreeMap<String, String>,
}

fn cache_dir(app_id_dir: Option<&Path>) -> Result<PathBuf> {
    match app_id_dir {
        Some(dir) => Ok(dir.join(".ld.so")),
        None => dirs::cache_dir()
            .map(|cache| cache.join("appbox/ld.so"))
            .ok_or_else(|| LaunchError::LdCache("no cache directory".to_string())),
    }
}

/// Return an fd for the cache under `key`, regenerating it through the
/// executor when missing. `base` is the partial argument stream with the
/// runtime, app and extensions mounted; `usr_links` the top-level /usr
/// symlinks.
pub fn ensure_ld_cache(
    cfg: &LdCacheConfig<'_>,
    base: &ArgStream,
    usr_links: &ArgStream,
    key: &str,
) -> Result<OwnedFd> {
    let dir = cache_dir(cfg.app_id_dir)?;
    let cache_path = dir.join(key);

    if let Ok(file) = fs::File::open(&cache_path) {
        log::debug!("Using cached ld.so.cache {}", cache_path.display());
        return Ok(file.into());
    }

    regenerate(cfg, base, usr_links, &dir, key)
}

fn regenerate(
    cfg: &LdCacheConfig<'_>,
    base: &ArgStream,
    usr_links: &ArgStream,
    dir: &Path,
    key: &str,
) -> Result<OwnedFd> {
    let cache_path = dir.join(key);
    log::debug!("Regenerating ld.so.cache {}", cache_path.display());

    fs::create_dir_all(dir).map_err(LaunchError::file("mkdir", dir))?;

    let mut extra = ArgStream::new();
    if cfg.generate_ld_so_conf {
        add_ld_so_conf(&mut extra)?;
    } else {
        extra.args(["--symlink", "../usr/etc/ld.so.conf", "/etc/ld.so.conf"]);
    }
    extra.args([
        "--unshare-pid",
        "--unshare-ipc",
        "--unshare-net",
        "--proc",
        "/proc",
        "--dev",
        "/dev",
    ]);
    extra.arg("--bind").arg(dir).arg(SANDBOX_CACHE_DIR);

    let sandbox_cache_path = format!("{SANDBOX_CACHE_DIR}/{key}");

    let mut command = Command::new(cfg.executor);
    command
        .args(base.args_list())
        .args(usr_links.args_list())
        .args(extra.args_list())
        .args(["ldconfig", "-X", "-C", sandbox_cache_path.as_str()])
        .env_clear()
        .envs(cfg.env);

    // The child needs every fd the argument stream references
    let inherited: Vec<i32> = base
        .fds_list()
        .iter()
        .chain(extra.fds_list())
        .map(|fd| fd.as_raw_fd())
        .collect();
    unsafe {
        command.pre_exec(move || {
            for fd in &inherited {
                if libc::fcntl(*fd, libc::F_SETFD, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let status = command
        .status()
        .map_err(|e| LaunchError::LdCache(format!("failed to run ldconfig: {e}")))?;
    if !status.success() {
        return Err(LaunchError::LdCache(format!(
            "ldconfig failed, exit status {status}"
        )));
    }

    let file = fs::File::open(&cache_path)
        .map_err(|_| LaunchError::LdCache("Can't open generated ld.so.cache".to_string()))?;

    if cfg.app_id_dir.is_none() {
        /* Appless runs regenerate every time; the fd is the only
         * reference once the file is gone. */
        let _ = fs::remove_file(&cache_path);
    } else {
        switch_symlink_and_remove(&dir.join("active"), key)?;
    }

    Ok(file.into())
}

/// Atomically point `active` at `new_target`, deleting the previously
/// active cache file.
fn switch_symlink_and_remove(active: &Path, new_target: &str) -> Result<()> {
    let old_target = fs::read_link(active).ok();

    let staging = active.with_extension("tmp");
    let _ = fs::remove_file(&staging);
    std::os::unix::fs::symlink(new_target, &staging)
        .map_err(LaunchError::file("symlink", &staging))?;
    fs::rename(&staging, active).map_err(LaunchError::file("rename", active))?;

    if let Some(old) = old_target {
        if old != Path::new(new_target) {
            if let Some(parent) = active.parent() {
                let _ = fs::remove_file(parent.join(old));
            }
        }
    }
    Ok(())
}
