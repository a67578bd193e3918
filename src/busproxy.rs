/// Filtering D-Bus proxy orchestration: filter argument assembly, the
/// minimal executor wrapper the proxy runs in, and the one-byte readiness
/// rendezvous.
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::argstream::{clear_cloexec, seal_data, ArgStream};
use crate::context::{BusPolicy, Context};
use crate::types::{LaunchError, Result};

/// Seconds to wait for the proxy to signal that all sockets are listening.
const PROXY_SYNC_TIMEOUT_SECS: u64 = 10;

/// Sandbox-side locations of the proxied buses.
pub fn session_bus_sandbox_path(uid: u32) -> String {
    format!("/run/user/{uid}/bus")
}
pub const SYSTEM_BUS_SANDBOX_PATH: &str = "/run/dbus/system_bus_socket";
pub fn a11y_bus_sandbox_path(uid: u32) -> String {
    format!("/run/user/{uid}/at-spi-bus")
}

/// Pull the socket path out of a `unix:path=…` bus address.
pub fn extract_unix_path_from_dbus_address(address: &str) -> Option<String> {
    if !address.starts_with("unix:") {
        return None;
    }
    let path = address.split(',').find_map(|part| {
        part.trim_start_matches("unix:")
            .strip_prefix("path=")
    })?;
    Some(path.to_string())
}

/// A unique, pre-created proxy socket under `<runtime-dir>/.dbus-proxy/`.
pub fn create_proxy_socket(runtime_dir: &Path, prefix: &str) -> Result<PathBuf> {
    let dir = runtime_dir.join(".dbus-proxy");
    fs::create_dir_all(&dir).map_err(LaunchError::file("mkdir", &dir))?;

    let name = format!("{prefix}-{}", uuid::Uuid::new_v4().simple());
    let socket = dir.join(name);
    fs::File::create(&socket).map_err(LaunchError::file("create", &socket))?;
    Ok(socket)
}

/// Append the `--filter` argument set derived from a bus policy map. The
/// app owns its own name (and children) on the session bus.
pub fn add_bus_filters(
    proxy_argv: &mut Vec<String>,
    policy: &BTreeMap<String, BusPolicy>,
    app_id: Option<&str>,
) {
    proxy_argv.push("--filter".to_string());
    if let Some(app_id) = app_id {
        proxy_argv.push(format!("--own={app_id}"));
        proxy_argv.push(format!("--own={app_id}.*"));
    }
    for (name, bus_policy) in policy {
        if *bus_policy > BusPolicy::None {
            proxy_argv.push(format!("--{}={name}", bus_policy.as_str()));
        }
    }
}

/// Route the session bus: a direct bind when unrestricted, otherwise a
/// fresh proxy socket whose upstream address goes into `proxy_argv`.
/// Returns whether a bus ended up available in the sandbox.
pub fn add_session_bus_args(
    stream: &mut ArgStream,
    env: &mut BTreeMap<String, String>,
    dbus_address: Option<&str>,
    proxy_argv: Option<&mut Vec<String>>,
    unrestricted: bool,
    runtime_dir: &Path,
    uid: u32,
) -> Result<bool> {
    let address = match dbus_address {
        Some(address) => address,
        None => return Ok(false),
    };
    let sandbox_path = session_bus_sandbox_path(uid);
    let sandbox_address = format!("unix:path={sandbox_path}");

    if unrestricted {
        if let Some(host_socket) = extract_unix_path_from_dbus_address(address) {
            stream.arg("--bind").arg(&host_socket).arg(&sandbox_path);
            env.insert("DBUS_SESSION_BUS_ADDRESS".to_string(), sandbox_address);
            return Ok(true);
        }
        return Ok(false);
    }

    if let Some(proxy_argv) = proxy_argv {
        let proxy_socket = create_proxy_socket(runtime_dir, "session-bus-proxy")?;
        proxy_argv.push(address.to_string());
        proxy_argv.push(proxy_socket.to_string_lossy().into_owned());

        stream.arg("--bind").arg(&proxy_socket).arg(&sandbox_path);
        env.insert("DBUS_SESSION_BUS_ADDRESS".to_string(), sandbox_address);
        return Ok(true);
    }

    Ok(false)
}

/// Route the system bus the same way; filtered access only happens when
/// the context actually carries system-bus policy entries.
pub fn add_system_bus_args(
    stream: &mut ArgStream,
    env: &mut BTreeMap<String, String>,
    context: &Context,
    dbus_address: Option<&str>,
    proxy_argv: Option<&mut Vec<String>>,
    unrestricted: bool,
    runtime_dir: &Path,
) -> Result<bool> {
    let host_socket = match dbus_address {
        Some(address) => extract_unix_path_from_dbus_address(address),
        None => {
            let default = Path::new("/var/run/dbus/system_bus_socket");
            default.exists().then(|| default.to_string_lossy().into_owned())
        }
    };

    if unrestricted {
        if let Some(host_socket) = host_socket {
            stream.arg("--bind").arg(&host_socket).arg(SYSTEM_BUS_SANDBOX_PATH);
            env.insert(
                "DBUS_SYSTEM_BUS_ADDRESS".to_string(),
                format!("unix:path={SYSTEM_BUS_SANDBOX_PATH}"),
            );
            return Ok(true);
        }
        return Ok(false);
    }

    if let Some(proxy_argv) = proxy_argv {
        if !context.system_bus_policy.is_empty() {
            let upstream = match dbus_address {
                Some(address) => address.to_string(),
                None => match &host_socket {
                    Some(socket) => format!("unix:path={socket}"),
                    None => return Ok(false),
                },
            };
            let proxy_socket = create_proxy_socket(runtime_dir, "system-bus-proxy")?;
            proxy_argv.push(upstream);
            proxy_argv.push(proxy_socket.to_string_lossy().into_owned());

            stream.arg("--bind").arg(&proxy_socket).arg(SYSTEM_BUS_SANDBOX_PATH);
            env.insert(
                "DBUS_SYSTEM_BUS_ADDRESS".to_string(),
                format!("unix:path={SYSTEM_BUS_SANDBOX_PATH}"),
            );
            return Ok(true);
        }
    }

    Ok(false)
}

/// The accessibility bus always goes through a proxy with a fixed filter
/// set allowing only the atspi registration traffic.
pub fn add_a11y_bus_args(
    stream: &mut ArgStream,
    env: &mut BTreeMap<String, String>,
    a11y_address: &str,
    runtime_dir: &Path,
    uid: u32,
) -> Result<Vec<String>> {
    let proxy_socket = create_proxy_socket(runtime_dir, "a11y-bus-proxy")?;
    let sandbox_path = a11y_bus_sandbox_path(uid);

    let mut proxy_argv = vec![
        a11y_address.to_string(),
        proxy_socket.to_string_lossy().into_owned(),
        "--filter".to_string(),
        "--sloppy-names".to_string(),
    ];
    for rule in [
        "org.a11y.atspi.Registry=org.a11y.atspi.Socket.Embed@/org/a11y/atspi/accessible/root",
        "org.a11y.atspi.Registry=org.a11y.atspi.Socket.Unembed@/org/a11y/atspi/accessible/root",
        "org.a11y.atspi.Registry=org.a11y.atspi.Registry.GetRegisteredEvents@/org/a11y/atspi/registry",
        "org.a11y.atspi.Registry=org.a11y.atspi.DeviceEventController.GetKeystrokeListeners@/org/a11y/atspi/registry/deviceeventcontroller",
        "org.a11y.atspi.Registry=org.a11y.atspi.DeviceEventController.GetDeviceEventListeners@/org/a11y/atspi/registry/deviceeventcontroller",
        "org.a11y.atspi.Registry=org.a11y.atspi.DeviceEventController.NotifyListenersSync@/org/a11y/atspi/registry/deviceeventcontroller",
        "org.a11y.atspi.Registry=org.a11y.atspi.DeviceEventController.NotifyListenersAsync@/org/a11y/atspi/registry/deviceeventcontroller",
    ] {
        proxy_argv.push(format!("--filter={rule}"));
    }

    stream.arg("--bind").arg(&proxy_socket).arg(&sandbox_path);
    env.insert(
        "AT_SPI_BUS_ADDRESS".to_string(),
        format!("unix:path={sandbox_path}"),
    );

    Ok(proxy_argv)
}

/// Build the wrapper argument stream that gives the proxy its own minimal
/// sandbox: every top-level host entry bound (tmp/var/run writable,
/// symlinks recreated verbatim), the proxy socket dir writable, and the
/// app-info fd injected as a plain file at /.flatpak-info.
pub fn wrapper_args_for_root(
    root: &Path,
    proxy_socket_dir: &Path,
    app_info_fd: i32,
) -> Result<ArgStream> {
    let mut wrapper = ArgStream::new();

    let mut entries: Vec<_> = fs::read_dir(root)
        .map_err(LaunchError::file("opendir", root))?
        .flatten()
        .collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        if name == ".flatpak-info" {
            continue;
        }
        let sandbox_path = Path::new("/").join(&name);
        let file_type = entry.file_type().map_err(LaunchError::file("stat", entry.path()))?;

        if file_type.is_dir() {
            let writable = name == "tmp" || name == "var" || name == "run";
            wrapper
                .arg(if writable { "--bind" } else { "--ro-bind" })
                .arg(&sandbox_path)
                .arg(&sandbox_path);
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())
                .map_err(LaunchError::file("readlink", entry.path()))?;
            wrapper.arg("--symlink").arg(&target).arg(&sandbox_path);
        }
    }

    wrapper.arg("--bind").arg(proxy_socket_dir).arg(proxy_socket_dir);

    /* A plain file rather than a bind mount: it stays readable through
     * /proc/<pid>/root even after the namespace is torn down. */
    wrapper
        .arg("--file")
        .arg(app_info_fd.to_string())
        .arg("/.flatpak-info");

    Ok(wrapper)
}

fn append_proxy_args(proxy_argv: &mut Vec<String>, args: Vec<String>, enable_logging: bool) {
    if !args.is_empty() {
        proxy_argv.extend(args);
        if enable_logging {
            proxy_argv.push("--log".to_string());
        }
    }
}

/// Per-bus proxy argument vectors collected while routing the buses.
#[derive(Debug, Default)]
pub struct BusProxyPlan {
    pub session: Vec<String>,
    pub session_logging: bool,
    pub system: Vec<String>,
    pub system_logging: bool,
    pub a11y: Vec<String>,
    pub a11y_logging: bool,
}

impl BusProxyPlan {
    pub fn is_empty(&self) -> bool {
        self.session.is_empty() && self.system.is_empty() && self.a11y.is_empty()
    }
}

/// The proxy helper binary, overridable for development.
fn proxy_helper() -> String {
    std::env::var("APPBOX_DBUSPROXY").unwrap_or_else(|_| "xdg-dbus-proxy".to_string())
}

/// Launch the filtering proxy inside its own executor sandbox and wait for
/// its one-byte readiness signal. On success the read end of the sync pipe
/// is attached to the app's argument stream as `--sync-fd`: when the app's
/// namespace goes away the proxy sees EOF and exits.
pub fn spawn_proxy(
    stream: &mut ArgStream,
    plan: BusProxyPlan,
    app_info_path: &str,
    executor: &Path,
    runtime_dir: &Path,
) -> Result<()> {
    if plan.is_empty() {
        return Ok(());
    }

    let (sync_read, sync_write) =
        nix::unistd::pipe().map_err(|e| LaunchError::Proxy(format!("sync pipe: {e}")))?;

    let mut proxy_argv = vec![proxy_helper(), format!("--fd={}", sync_write.as_raw_fd())];
    append_proxy_args(&mut proxy_argv, plan.session, plan.session_logging);
    append_proxy_args(&mut proxy_argv, plan.system, plan.system_logging);
    append_proxy_args(&mut proxy_argv, plan.a11y, plan.a11y_logging);

    let app_info: OwnedFd = fs::File::open(app_info_path)
        .map_err(LaunchError::file("open", app_info_path))?
        .into();

    let wrapper = wrapper_args_for_root(
        Path::new("/"),
        &runtime_dir.join(".dbus-proxy"),
        app_info.as_raw_fd(),
    )?;
    let wrapper_fd = seal_data("bwrap-args", &wrapper.to_bytes())?;

    log::debug!("Running proxy: {proxy_argv:?}");

    let mut command = Command::new(executor);
    command.arg("--args").arg(wrapper_fd.as_raw_fd().to_string());
    command.args(&proxy_argv);

    let inherited = [
        sync_write.as_raw_fd(),
        app_info.as_raw_fd(),
        wrapper_fd.as_raw_fd(),
    ];
    unsafe {
        command.pre_exec(move || {
            for fd in inherited {
                if libc::fcntl(fd, libc::F_SETFD, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    command
        .spawn()
        .map_err(|e| LaunchError::Proxy(format!("failed to start proxy: {e}")))?;

    // Our copy of the write end closes now; only the proxy holds it.
    drop(sync_write);
    drop(app_info);
    drop(wrapper_fd);

    wait_for_ready(&sync_read)?;

    stream.arg_fd("--sync-fd", sync_read);
    Ok(())
}

/// Block until the proxy writes its readiness byte, EOF, or the timeout.
fn wait_for_ready(sync_read: &OwnedFd) -> Result<()> {
    let mut pollfd = libc::pollfd {
        fd: sync_read.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pollfd, 1, (PROXY_SYNC_TIMEOUT_SECS * 1000) as i32) };
    if rc < 0 {
        return Err(LaunchError::Proxy(format!(
            "sync poll: {}",
            std::io::Error::last_os_error()
        )));
    }
    if rc == 0 {
        return Err(LaunchError::ProxyTimeout(PROXY_SYNC_TIMEOUT_SECS));
    }

    let mut byte = [0u8; 1];
    let mut file = fs::File::from(
        sync_read
            .try_clone()
            .map_err(|e| LaunchError::Proxy(format!("sync fd: {e}")))?,
    );
    file.read_exact(&mut byte)
        .map_err(|_| LaunchError::Proxy("Failed to sync with dbus proxy".to_string()))?;
    Ok(())
}

/// Unset close-on-exec on the stream's fd list; used by callers that exec
/// the executor directly instead of going through a child-setup hook.
pub fn prepare_fds_for_exec(stream: &ArgStream) -> Result<()> {
    clear_cloexec(stream.fds_list())
}
