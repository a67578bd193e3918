/// The immutable per-instance info file mounted at /.flatpak-info.
use std::fs;
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

use crate::argstream::ArgStream;
use crate::context::{Context, SOCKET_SESSION_BUS, SOCKET_SYSTEM_BUS};
use crate::deploy::{GROUP_APPLICATION, GROUP_RUNTIME, KEY_NAME, KEY_RUNTIME};
use crate::keyfile::KeyFile;
use crate::types::{LaunchError, Result};

pub const INFO_PATH: &str = "/.flatpak-info";

pub const GROUP_INSTANCE: &str = "Instance";
pub const KEY_APP_PATH: &str = "app-path";
pub const KEY_APP_COMMIT: &str = "app-commit";
pub const KEY_APP_EXTENSIONS: &str = "app-extensions";
pub const KEY_RUNTIME_PATH: &str = "runtime-path";
pub const KEY_RUNTIME_COMMIT: &str = "runtime-commit";
pub const KEY_RUNTIME_EXTENSIONS: &str = "runtime-extensions";
pub const KEY_BRANCH: &str = "branch";
pub const KEY_LAUNCHER_VERSION: &str = "launcher-version";
pub const KEY_SESSION_BUS_PROXY: &str = "session-bus-proxy";
pub const KEY_SYSTEM_BUS_PROXY: &str = "system-bus-proxy";

/// Everything recorded about one launched instance.
pub struct AppInfo<'a> {
    pub app_id: &'a str,
    pub runtime_ref: &'a str,
    pub app_files: Option<&'a Path>,
    pub app_commit: Option<&'a str>,
    pub app_extensions: &'a str,
    pub runtime_files: &'a Path,
    pub runtime_commit: &'a str,
    pub runtime_extensions: &'a str,
    pub branch: Option<&'a str>,
    pub context: &'a Context,
}

impl AppInfo<'_> {
    /// The info file contents: identity, paths and commits under the
    /// Application (or Runtime) and Instance groups, plus the flattened
    /// final context.
    pub fn build_keyfile(&self) -> KeyFile {
        let mut keyfile = KeyFile::new();

        let group = if self.app_files.is_some() {
            GROUP_APPLICATION
        } else {
            GROUP_RUNTIME
        };
        keyfile.set_string(group, KEY_NAME, self.app_id);
        keyfile.set_string(group, KEY_RUNTIME, self.runtime_ref);

        if let Some(app_files) = self.app_files {
            keyfile.set_string(GROUP_INSTANCE, KEY_APP_PATH, &app_files.to_string_lossy());
        }
        if let Some(commit) = self.app_commit {
            keyfile.set_string(GROUP_INSTANCE, KEY_APP_COMMIT, commit);
        }
        if !self.app_extensions.is_empty() {
            keyfile.set_string(GROUP_INSTANCE, KEY_APP_EXTENSIONS, self.app_extensions);
        }
        keyfile.set_string(
            GROUP_INSTANCE,
            KEY_RUNTIME_PATH,
            &self.runtime_files.to_string_lossy(),
        );
        keyfile.set_string(GROUP_INSTANCE, KEY_RUNTIME_COMMIT, self.runtime_commit);
        if !self.runtime_extensions.is_empty() {
            keyfile.set_string(GROUP_INSTANCE, KEY_RUNTIME_EXTENSIONS, self.runtime_extensions);
        }
        if let Some(branch) = self.branch {
            keyfile.set_string(GROUP_INSTANCE, KEY_BRANCH, branch);
        }
        keyfile.set_string(GROUP_INSTANCE, KEY_LAUNCHER_VERSION, env!("CARGO_PKG_VERSION"));

        if !self.context.sockets.has(SOCKET_SESSION_BUS) {
            keyfile.set_boolean(GROUP_INSTANCE, KEY_SESSION_BUS_PROXY, true);
        }
        if !self.context.sockets.has(SOCKET_SYSTEM_BUS) {
            keyfile.set_boolean(GROUP_INSTANCE, KEY_SYSTEM_BUS_PROXY, true);
        }

        self.context.save_metadata(true, &mut keyfile);
        keyfile
    }
}

/// Emit the info file into the argument stream.
///
/// The file must stay readable via openat() through /proc/<pid>/root even
/// while the namespace is being torn down, so it is written twice: a real
/// file (`--file`), then a read-only bind of the same data on top of it.
/// If the bind gets unmounted the underlying file still has the real
/// contents.
///
/// Returns the `/proc/self/fd/N` path later used to hand the same data to
/// the bus proxy.
pub fn add_app_info_args(stream: &mut ArgStream, info: &AppInfo<'_>, uid: u32) -> Result<String> {
    let contents = info.build_keyfile().to_string();

    let mut tmp = tempfile::NamedTempFile::new()
        .map_err(|e| LaunchError::Config(format!("Failed to open app info temp file: {e}")))?;
    tmp.write_all(contents.as_bytes())
        .map_err(|e| LaunchError::Config(format!("Failed to write app info: {e}")))?;
    tmp.flush()
        .map_err(|e| LaunchError::Config(format!("Failed to write app info: {e}")))?;

    let fd: OwnedFd = fs::File::open(tmp.path())
        .map_err(LaunchError::file("open", tmp.path()))?
        .into();
    let fd2: OwnedFd = fs::File::open(tmp.path())
        .map_err(LaunchError::file("open", tmp.path()))?
        .into();

    // Both fds are open, the path can go away
    tmp.close()
        .map_err(|e| LaunchError::Config(format!("Failed to unlink app info temp file: {e}")))?;

    let proc_path = format!("/proc/self/fd/{}", fd.as_raw_fd());

    stream.arg_fd_path("--file", fd, INFO_PATH);
    stream.arg_fd_path("--ro-bind-data", fd2, INFO_PATH);
    stream
        .arg("--symlink")
        .arg("../../../.flatpak-info")
        .arg(format!("/run/user/{uid}/flatpak-info"));

    Ok(proc_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn test_info<'a>(context: &'a Context, app_files: Option<&'a Path>) -> AppInfo<'a> {
        AppInfo {
            app_id: "org.example.App",
            runtime_ref: "runtime/org.example.Platform/x86_64/1.0",
            app_files,
            app_commit: app_files.map(|_| "appc0mmit"),
            app_extensions: "",
            runtime_files: Path::new("/deploys/runtime/files"),
            runtime_commit: "rtc0mmit",
            runtime_extensions: "org.example.GL.default=feed",
            branch: Some("stable"),
            context,
        }
    }

    #[test]
    fn test_keyfile_contents_for_app() {
        let mut context = Context::new();
        context.share("network").unwrap();

        let info = test_info(&context, Some(Path::new("/deploys/app/files")));
        let keyfile = info.build_keyfile();

        assert_eq!(
            keyfile.get_string(GROUP_APPLICATION, KEY_NAME).as_deref(),
            Some("org.example.App")
        );
        assert_eq!(
            keyfile.get_string(GROUP_INSTANCE, KEY_APP_PATH).as_deref(),
            Some("/deploys/app/files")
        );
        assert_eq!(
            keyfile.get_string(GROUP_INSTANCE, KEY_RUNTIME_COMMIT).as_deref(),
            Some("rtc0mmit")
        );
        assert_eq!(
            keyfile.get_string(GROUP_INSTANCE, KEY_RUNTIME_EXTENSIONS).as_deref(),
            Some("org.example.GL.default=feed")
        );
        // No app extensions recorded when the summary is empty
        assert!(!keyfile.has_key(GROUP_INSTANCE, KEY_APP_EXTENSIONS));
        // The flattened context is embedded
        assert_eq!(
            keyfile.get_string_list(crate::context::GROUP_CONTEXT, crate::context::KEY_SHARED),
            Some(vec!["network".to_string()])
        );
    }

    #[test]
    fn test_bus_proxy_booleans_track_socket_grants() {
        let restricted = Context::new();
        let info = test_info(&restricted, None);
        let keyfile = info.build_keyfile();
        assert_eq!(keyfile.get_boolean(GROUP_INSTANCE, KEY_SESSION_BUS_PROXY), Some(true));
        assert_eq!(keyfile.get_boolean(GROUP_INSTANCE, KEY_SYSTEM_BUS_PROXY), Some(true));
        // Runtime-only launches use the Runtime group
        assert!(keyfile.has_group(GROUP_RUNTIME));

        let mut open = Context::new();
        open.socket("session-bus").unwrap();
        open.socket("system-bus").unwrap();
        let info = test_info(&open, None);
        let keyfile = info.build_keyfile();
        assert!(!keyfile.has_key(GROUP_INSTANCE, KEY_SESSION_BUS_PROXY));
        assert!(!keyfile.has_key(GROUP_INSTANCE, KEY_SYSTEM_BUS_PROXY));
    }

    #[test]
    fn test_add_app_info_args_double_mount() {
        let context = Context::new();
        let info = test_info(&context, None);

        let mut stream = ArgStream::new();
        let proc_path = add_app_info_args(&mut stream, &info, 1000).unwrap();

        let args = stream.args_lossy();
        let file_pos = args.iter().position(|a| a == "--file").unwrap();
        let bind_pos = args.iter().position(|a| a == "--ro-bind-data").unwrap();
        assert!(file_pos < bind_pos);
        assert_eq!(args[file_pos + 2], INFO_PATH);
        assert_eq!(args[bind_pos + 2], INFO_PATH);
        assert_eq!(stream.fds_list().len(), 2);

        // The proc path names the first fd
        assert_eq!(
            proc_path,
            format!("/proc/self/fd/{}", stream.fds_list()[0].as_raw_fd())
        );

        // The symlink into the runtime dir is present
        let sym = args.iter().position(|a| a == "--symlink").unwrap();
        assert_eq!(args[sym + 1], "../../../.flatpak-info");
        assert_eq!(args[sym + 2], "/run/user/1000/flatpak-info");

        // Both fds read back the full contents even though the temp file
        // is gone
        let mut contents = String::new();
        fs::File::from(stream.fds_list()[1].try_clone().unwrap())
            .read_to_string(&mut contents)
            .unwrap();
        assert!(contents.contains("[Runtime]"));
        assert!(contents.contains("launcher-version="));
    }
}
