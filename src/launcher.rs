/// Launch orchestration: composes the final context, assembles the full
/// executor argument stream in order, launches the bus proxies and execs
/// (or spawns) the executor.
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::os::fd::AsRawFd;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::appinfo::{add_app_info_args, AppInfo};
use crate::argstream::{clear_cloexec, ArgStream};
use crate::blobs;
use crate::busproxy::{
    add_a11y_bus_args, add_bus_filters, add_session_bus_args, add_system_bus_args, spawn_proxy,
    BusProxyPlan,
};
use crate::context::{
    Context, FilesystemMode, DEVICE_ALL, DEVICE_DRI, DEVICE_KVM, FEATURE_DEVEL, FEATURE_MULTIARCH,
    SHARE_IPC, SHARE_NETWORK, SOCKET_PULSEAUDIO, SOCKET_SESSION_BUS, SOCKET_SYSTEM_BUS, SOCKET_WAYLAND,
    SOCKET_X11,
};
use crate::deploy::{
    ensure_data_dir, DeployStore, Ref, RefKind, GROUP_APPLICATION, KEY_COMMAND, KEY_RUNTIME, KEY_SDK,
};
use crate::exposure::{
    plan_from_context, resolve_xdg_storage_dir, ExposurePlan, PlanOptions, PlanOutcome,
};
use crate::extensions::{add_extension_args, list_extensions};
use crate::ldcache::{add_ld_so_conf, cache_key, ensure_ld_cache, LdCacheConfig};
use crate::seccomp::{
    apply_personality, is_linux32_arch, setup_seccomp, SeccompOptions, PER_LINUX, PER_LINUX32,
};
use crate::services::{DocumentPortal, SessionServices};
use crate::types::{LaunchError, Result};

/// Launch behavior toggles beyond what the context carries.
#[derive(Debug, Clone, Default)]
pub struct LaunchFlags {
    pub devel: bool,
    pub background: bool,
    pub file_forwarding: bool,
    pub log_session_bus: bool,
    pub log_system_bus: bool,
    pub log_a11y_bus: bool,
    pub no_session_bus_proxy: bool,
    pub no_system_bus_proxy: bool,
    pub no_a11y_bus_proxy: bool,
    pub no_documents_portal: bool,
    pub writable_etc: bool,
    pub die_with_parent: bool,
    pub set_personality: bool,
}

pub struct LaunchOptions {
    pub app_ref: Ref,
    pub store: DeployStore,
    pub extra_context: Option<Context>,
    pub custom_runtime: Option<String>,
    pub custom_runtime_version: Option<String>,
    pub custom_command: Option<String>,
    pub forwarded_args: Vec<String>,
    pub flags: LaunchFlags,
    pub executor: PathBuf,
}

const DEFAULT_EXPORTS: &[(&str, Option<&str>)] = &[
    ("PATH", Some("/app/bin:/usr/bin")),
    /* LD_LIBRARY_PATH drags host dependencies into the sandbox; without
     * the ld.so cache it is set to /app/lib instead. */
    ("LD_LIBRARY_PATH", None),
    ("XDG_CONFIG_DIRS", Some("/app/etc/xdg:/etc/xdg")),
    ("XDG_DATA_DIRS", Some("/app/share:/usr/share")),
    ("SHELL", Some("/bin/sh")),
    ("TMPDIR", None), // may not exist in the sandbox
    ("PYTHONPATH", None),
    ("PERLLIB", None),
    ("PERL5LIB", None),
    ("XCURSOR_PATH", None),
];

const DEVEL_EXPORTS: &[(&str, &str)] = &[
    ("ACLOCAL_PATH", "/app/share/aclocal"),
    ("C_INCLUDE_PATH", "/app/include"),
    ("CPLUS_INCLUDE_PATH", "/app/include"),
    ("LDFLAGS", "-L/app/lib "),
    (
        "PKG_CONFIG_PATH",
        "/app/lib/pkgconfig:/app/share/pkgconfig:/usr/lib/pkgconfig:/usr/share/pkgconfig",
    ),
    ("LC_ALL", "en_US.utf8"),
];

const ENV_COPY: &[&str] = &[
    "PWD",
    "GDMSESSION",
    "XDG_CURRENT_DESKTOP",
    "XDG_SESSION_DESKTOP",
    "DESKTOP_SESSION",
    "EMAIL_ADDRESS",
    "HOME",
    "HOSTNAME",
    "LOGNAME",
    "REAL_NAME",
    "TERM",
    "USER",
    "USERNAME",
];

const ENV_COPY_NODEVEL: &[&str] = &[
    "LANG",
    "LANGUAGE",
    "LC_ALL",
    "LC_ADDRESS",
    "LC_COLLATE",
    "LC_CTYPE",
    "LC_IDENTIFICATION",
    "LC_MEASUREMENT",
    "LC_MESSAGES",
    "LC_MONETARY",
    "LC_NAME",
    "LC_NUMERIC",
    "LC_PAPER",
    "LC_TELEPHONE",
    "LC_TIME",
];

/// The environment the sandboxed process starts from: fixed exports plus a
/// verbatim copy of the session identity variables.
pub fn minimal_env(devel: bool, use_ld_so_cache: bool) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    for (name, value) in DEFAULT_EXPORTS {
        if let Some(value) = value {
            env.insert((*name).to_string(), (*value).to_string());
        }
    }
    if !use_ld_so_cache {
        env.insert("LD_LIBRARY_PATH".to_string(), "/app/lib".to_string());
    }
    if devel {
        for (name, value) in DEVEL_EXPORTS {
            env.insert((*name).to_string(), (*value).to_string());
        }
    }

    for name in ENV_COPY {
        if let Ok(value) = std::env::var(name) {
            env.insert((*name).to_string(), value);
        }
    }
    if !devel {
        for name in ENV_COPY_NODEVEL {
            if let Ok(value) = std::env::var(name) {
                env.insert((*name).to_string(), value);
            }
        }
    }

    env
}

fn apply_env_appid(env: &mut BTreeMap<String, String>, app_id_dir: &Path) {
    env.insert(
        "XDG_DATA_HOME".to_string(),
        app_id_dir.join("data").to_string_lossy().into_owned(),
    );
    env.insert(
        "XDG_CONFIG_HOME".to_string(),
        app_id_dir.join("config").to_string_lossy().into_owned(),
    );
    env.insert(
        "XDG_CACHE_HOME".to_string(),
        app_id_dir.join("cache").to_string_lossy().into_owned(),
    );
}

fn apply_env_vars(env: &mut BTreeMap<String, String>, context: &Context) {
    for (name, value) in &context.env_vars {
        if value.is_empty() {
            env.remove(name);
        } else {
            env.insert(name.clone(), value.clone());
        }
    }
}

/// Top-level /lib, /bin etc. symlinks into /usr, for the directories the
/// runtime actually ships.
pub fn setup_usr_links(stream: &mut ArgStream, runtime_files: &Path) {
    for subdir in ["lib", "lib32", "lib64", "bin", "sbin"] {
        if runtime_files.join(subdir).exists() {
            stream
                .arg("--symlink")
                .arg(format!("usr/{subdir}"))
                .arg(format!("/{subdir}"));
        }
    }
}

/// /etc/localtime, resolv.conf, host.conf and hosts, each existence-gated.
/// localtime stays a symlink when it already points into /usr (i.e. into
/// the runtime's zoneinfo).
fn add_monitor_path_args(stream: &mut ArgStream) {
    let localtime = Path::new("/etc/localtime");
    if localtime.exists() {
        let reachable_target = fs::read_link(localtime).ok().and_then(|target| {
            let resolved = crate::exposure::canonicalize_lexical(&Path::new("/etc").join(&target));
            resolved.starts_with("/usr").then_some(target)
        });
        match reachable_target {
            Some(target) => {
                stream.arg("--symlink").arg(target).arg("/etc/localtime");
            }
            None => {
                stream.args(["--ro-bind", "/etc/localtime", "/etc/localtime"]);
            }
        }
    }

    for conf in ["/etc/resolv.conf", "/etc/host.conf", "/etc/hosts"] {
        if Path::new(conf).exists() {
            stream.args(["--ro-bind", conf, conf]);
        }
    }
}

fn add_journal_args(stream: &mut ArgStream) {
    for socket in ["/run/systemd/journal/socket", "/run/systemd/journal/stdout"] {
        if Path::new(socket).exists() {
            stream.args(["--bind", socket, socket]);
        }
    }
}

const SYSTEM_FONTS_DIR: &str = "/usr/share/fonts";
const SYSTEM_FONT_CACHE_DIRS: &[&str] = &["/var/cache/fontconfig", "/usr/lib/fontconfig/cache"];

fn add_font_path_args(stream: &mut ArgStream, home_dir: &Path) {
    if Path::new(SYSTEM_FONTS_DIR).exists() {
        stream.args(["--ro-bind", SYSTEM_FONTS_DIR, "/run/host/fonts"]);
    }

    let mut found_cache = false;
    for &cache_dir in SYSTEM_FONT_CACHE_DIRS {
        if Path::new(cache_dir).exists() {
            stream.args(["--ro-bind", cache_dir, "/run/host/fonts-cache"]);
            found_cache = true;
            break;
        }
    }
    if !found_cache {
        /* These must never be writable or fontconfig would put its
         * default cache there. */
        stream.args([
            "--tmpfs",
            "/run/host/fonts-cache",
            "--remount-ro",
            "/run/host/fonts-cache",
        ]);
    }

    let user_font1 = home_dir.join(".local/share/fonts");
    let user_font2 = home_dir.join(".fonts");
    if user_font1.exists() {
        stream.arg("--ro-bind").arg(&user_font1).arg("/run/host/user-fonts");
    } else if user_font2.exists() {
        stream.arg("--ro-bind").arg(&user_font2).arg("/run/host/user-fonts");
    }

    let user_font_cache = home_dir.join(".cache/fontconfig");
    if user_font_cache.exists() {
        stream
            .arg("--ro-bind")
            .arg(&user_font_cache)
            .arg("/run/host/user-fonts-cache");
    } else {
        stream.args([
            "--tmpfs",
            "/run/host/user-fonts-cache",
            "--remount-ro",
            "/run/host/user-fonts-cache",
        ]);
    }
}

fn add_icon_path_args(stream: &mut ArgStream) {
    if Path::new("/usr/share/icons").is_dir() {
        stream.args(["--ro-bind", "/usr/share/icons", "/run/host/share/icons"]);
    }
}

/// X11: /tmp/.X11-unix is always covered so the host sockets never leak
/// in; with access granted the requested display socket is bound as
/// display 99 and a filtered Xauthority is generated.
fn add_x11_args(
    stream: &mut ArgStream,
    env: &mut BTreeMap<String, String>,
    allowed: bool,
    display: Option<&str>,
    uid: u32,
) -> Result<()> {
    stream.args(["--tmpfs", "/tmp/.X11-unix"]);

    if !allowed {
        env.remove("DISPLAY");
        return Ok(());
    }

    log::debug!("Allowing x11 access");

    let display_nr = display.and_then(|d| {
        let rest = d.strip_prefix(':')?;
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        (!digits.is_empty()).then_some(digits)
    });

    let display_nr = match display_nr {
        Some(nr) => nr,
        None => {
            env.remove("DISPLAY");
            return Ok(());
        }
    };

    let x11_socket = format!("/tmp/.X11-unix/X{display_nr}");
    stream.args(["--bind", x11_socket.as_str(), "/tmp/.X11-unix/X99"]);
    env.insert("DISPLAY".to_string(), ":99.0".to_string());

    if let Some(xauth_path) = blobs::xauth_path() {
        if let Ok(mut file) = fs::File::open(&xauth_path) {
            match blobs::hostname() {
                Ok(hostname) => {
                    let data = blobs::filtered_xauth_data(&mut file, &hostname, &display_nr);
                    let dest = format!("/run/user/{uid}/Xauthority");
                    stream.add_data("xauth", &data, &dest)?;
                    env.insert("XAUTHORITY".to_string(), dest);
                }
                Err(e) => log::warn!("uname failed, skipping Xauthority: {e}"),
            }
        }
    }

    Ok(())
}

fn add_wayland_args(
    stream: &mut ArgStream,
    runtime_dir: &Path,
    wayland_display: Option<&str>,
    uid: u32,
) {
    let display = wayland_display.unwrap_or("wayland-0");
    let socket = runtime_dir.join(display);
    if socket.exists() {
        stream
            .arg("--bind")
            .arg(&socket)
            .arg(format!("/run/user/{uid}/{display}"));
    }
}

fn add_pulseaudio_args(
    stream: &mut ArgStream,
    env: &mut BTreeMap<String, String>,
    runtime_dir: &Path,
    uid: u32,
) -> Result<()> {
    env.remove("PULSE_SERVER");
    let socket = runtime_dir.join("pulse/native");
    if !socket.exists() {
        return Ok(());
    }

    let config_path = format!("/run/user/{uid}/pulse/config");
    stream.add_data("pulseaudio", blobs::PULSE_CLIENT_CONFIG.as_bytes(), &config_path)?;
    stream
        .arg("--bind")
        .arg(&socket)
        .arg(format!("/run/user/{uid}/pulse/native"));
    env.insert(
        "PULSE_SERVER".to_string(),
        format!("unix:/run/user/{uid}/pulse/native"),
    );
    env.insert("PULSE_CLIENTCONFIG".to_string(), config_path);
    Ok(())
}

/// Host-session inputs to the environment assembly, hoisted out so tests
/// can pin them.
pub struct EnvironmentOptions<'a> {
    pub app_id: &'a str,
    pub app_id_dir: Option<&'a Path>,
    pub home_dir: PathBuf,
    pub runtime_dir: PathBuf,
    pub uid: u32,
    pub user_install_dir: Option<PathBuf>,
    pub display: Option<String>,
    pub wayland_display: Option<String>,
    pub session_bus_address: Option<String>,
    pub system_bus_address: Option<String>,
    pub a11y_address: Option<String>,
    pub flags: LaunchFlags,
}

impl<'a> EnvironmentOptions<'a> {
    pub fn from_host(
        app_id: &'a str,
        app_id_dir: Option<&'a Path>,
        a11y_address: Option<String>,
        flags: LaunchFlags,
    ) -> Result<Self> {
        let home_dir = dirs::home_dir()
            .ok_or_else(|| LaunchError::Config("No home directory".to_string()))?;
        let uid = nix::unistd::Uid::current().as_raw();
        let runtime_dir = dirs::runtime_dir().unwrap_or_else(|| PathBuf::from(format!("/run/user/{uid}")));

        Ok(EnvironmentOptions {
            app_id,
            app_id_dir,
            home_dir,
            runtime_dir,
            uid,
            user_install_dir: DeployStore::user_base_dir(),
            display: std::env::var("DISPLAY").ok(),
            wayland_display: std::env::var("WAYLAND_DISPLAY").ok(),
            session_bus_address: std::env::var("DBUS_SESSION_BUS_ADDRESS").ok(),
            system_bus_address: std::env::var("DBUS_SYSTEM_BUS_ADDRESS").ok(),
            a11y_address,
            flags,
        })
    }
}

/// Everything the context implies for the sandbox environment: namespaces,
/// devices, the filesystem exposure, sockets and bus routing. Returns the
/// plan (for visibility queries) and the proxy argument vectors (spawned
/// by the caller).
pub fn add_environment_args(
    stream: &mut ArgStream,
    env: &mut BTreeMap<String, String>,
    context: &Context,
    opts: &EnvironmentOptions<'_>,
) -> Result<(ExposurePlan, BusProxyPlan)> {
    if !context.shares.has(SHARE_IPC) {
        log::debug!("Disallowing ipc access");
        stream.arg("--unshare-ipc");
    }
    if !context.shares.has(SHARE_NETWORK) {
        log::debug!("Disallowing network access");
        stream.arg("--unshare-net");
    }

    if context.devices.has(DEVICE_ALL) {
        stream.args(["--dev-bind", "/dev", "/dev"]);
    } else {
        stream.args(["--dev", "/dev"]);
        if context.devices.has(DEVICE_DRI) {
            log::debug!("Allowing dri access");
            for dev in [
                "/dev/dri",
                "/dev/mali",
                "/dev/umplock",
                "/dev/nvidiactl",
                "/dev/nvidia0",
                "/dev/nvidia-modeset",
            ] {
                if Path::new(dev).exists() {
                    stream.args(["--dev-bind", dev, dev]);
                }
            }
        }
        if context.devices.has(DEVICE_KVM) && Path::new("/dev/kvm").exists() {
            log::debug!("Allowing kvm access");
            stream.args(["--dev-bind", "/dev/kvm", "/dev/kvm"]);
        }
    }

    let PlanOutcome {
        plan,
        home_access,
        xdg_dirs,
    } = plan_from_context(
        context,
        &PlanOptions {
            app_id_dir: opts.app_id_dir,
            user_install_dir: opts.user_install_dir.as_deref(),
            home_dir: &opts.home_dir,
            create_dirs: true,
        },
    );

    if let Some(app_id_dir) = opts.app_id_dir {
        apply_env_appid(env, app_id_dir);
    }

    if !home_access {
        /* Persistent paths only make sense without real home access */
        for persist in &context.persistent {
            let src = opts
                .home_dir
                .join(".var/app")
                .join(opts.app_id)
                .join(persist);
            let dest = opts.home_dir.join(persist);
            let _ = fs::DirBuilder::new().recursive(true).mode(0o755).create(&src);
            /* The destination need not exist outside the sandbox, a plain
             * bind is enough. */
            stream.arg("--bind").arg(&src).arg(&dest);
        }
    }

    {
        let run_app_src = opts.runtime_dir.join("app").join(opts.app_id);
        let run_app_dst = format!("/run/user/{}/app/{}", opts.uid, opts.app_id);
        if fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&run_app_src)
            .is_ok()
        {
            stream.arg("--bind").arg(&run_app_src).arg(&run_app_dst);
        }
    }

    plan.emit_args(stream);

    /* Explicitly granted xdg-{data,config,cache} subtrees also get bound
     * inside the per-app dir, so apps can opt out of per-app storage for
     * them. */
    if let Some(app_id_dir) = opts.app_id_dir {
        for (filesystem, mode) in &context.filesystems {
            let mode = match mode {
                Some(mode) => *mode,
                None => continue,
            };
            if mode < FilesystemMode::ReadOnly {
                continue;
            }
            if let Some((where_, root, rest)) = resolve_xdg_storage_dir(filesystem) {
                if rest.is_empty() {
                    continue;
                }
                let xdg_path = root.join(&rest);
                if !(xdg_path.is_dir() || xdg_path.is_file()) {
                    continue;
                }
                let dest = app_id_dir.join(where_).join(&rest);
                if let Ok(dest_real) = fs::canonicalize(&dest) {
                    stream
                        .arg(if mode == FilesystemMode::ReadOnly {
                            "--ro-bind"
                        } else {
                            "--bind"
                        })
                        .arg(&xdg_path)
                        .arg(&dest_real);
                }
            }
        }
    }

    if let Some(app_id_dir) = opts.app_id_dir {
        let dest = app_id_dir.join("config/user-dirs.dirs");
        if home_access {
            let src = opts.home_dir.join(".config/user-dirs.dirs");
            if src.exists() {
                /* The destination must already resolve on the host, the
                 * executor cannot create it inside the read-only binds. */
                if let Ok(dest_real) = fs::canonicalize(&dest) {
                    stream.arg("--ro-bind").arg(&src).arg(&dest_real);
                }
            }
        } else if !xdg_dirs.is_empty() {
            let contents = blobs::user_dirs_contents(&xdg_dirs);
            stream.add_data("xdg-config-dirs", contents.as_bytes(), &dest)?;
        }
    }

    add_x11_args(
        stream,
        env,
        context.sockets.has(SOCKET_X11),
        opts.display.as_deref(),
        opts.uid,
    )?;

    if context.sockets.has(SOCKET_WAYLAND) {
        log::debug!("Allowing wayland access");
        add_wayland_args(stream, &opts.runtime_dir, opts.wayland_display.as_deref(), opts.uid);
    }

    if context.sockets.has(SOCKET_PULSEAUDIO) {
        log::debug!("Allowing pulseaudio access");
        add_pulseaudio_args(stream, env, &opts.runtime_dir, opts.uid)?;
    }

    let mut proxy_plan = BusProxyPlan {
        session_logging: opts.flags.log_session_bus,
        system_logging: opts.flags.log_system_bus,
        a11y_logging: opts.flags.log_a11y_bus,
        ..Default::default()
    };

    let unrestricted_session = context.sockets.has(SOCKET_SESSION_BUS);
    if unrestricted_session {
        log::debug!("Allowing session-dbus access");
    }
    let session_proxy = (!opts.flags.no_session_bus_proxy).then_some(&mut proxy_plan.session);
    if add_session_bus_args(
        stream,
        env,
        opts.session_bus_address.as_deref(),
        session_proxy,
        unrestricted_session,
        &opts.runtime_dir,
        opts.uid,
    )? && !unrestricted_session
        && !opts.flags.no_session_bus_proxy
    {
        add_bus_filters(
            &mut proxy_plan.session,
            &context.session_bus_policy,
            Some(opts.app_id),
        );
    }

    let unrestricted_system = context.sockets.has(SOCKET_SYSTEM_BUS);
    if unrestricted_system {
        log::debug!("Allowing system-dbus access");
    }
    let system_proxy = (!opts.flags.no_system_bus_proxy).then_some(&mut proxy_plan.system);
    if add_system_bus_args(
        stream,
        env,
        context,
        opts.system_bus_address.as_deref(),
        system_proxy,
        unrestricted_system,
        &opts.runtime_dir,
    )? && !unrestricted_system
        && !opts.flags.no_system_bus_proxy
    {
        add_bus_filters(&mut proxy_plan.system, &context.system_bus_policy, None);
    }

    if !opts.flags.no_a11y_bus_proxy {
        if let Some(address) = &opts.a11y_address {
            proxy_plan.a11y = add_a11y_bus_args(stream, env, address, &opts.runtime_dir, opts.uid)?;
        }
    }

    /* The executor is typically setuid and scrubs LD_LIBRARY_PATH from its
     * own environment; smuggle it through as an explicit argument. */
    if let Some(ld_library_path) = env.remove("LD_LIBRARY_PATH") {
        stream.args(["--setenv", "LD_LIBRARY_PATH", ld_library_path.as_str()]);
    }

    Ok((plan, proxy_plan))
}

/// The fixed part of the sandbox: pid namespace, /proc, base directories,
/// /sys subset, synthesized passwd/group, machine-id, the runtime's /etc,
/// the per-app var binds, /usr symlinks, personality, seccomp and the
/// monitored /etc files.
pub fn setup_base_argv(
    stream: &mut ArgStream,
    runtime_files: &Path,
    app_id_dir: Option<&Path>,
    arch: &str,
    flags: &LaunchFlags,
    multiarch: bool,
    devel: bool,
    uid: u32,
) -> Result<()> {
    let run_dir = format!("/run/user/{uid}");

    let user = blobs::UserInfo::current()?;
    let passwd = blobs::passwd_contents(&user);
    let group = blobs::group_contents(&user);

    stream.args([
        "--unshare-pid",
        "--proc",
        "/proc",
        "--dir",
        "/tmp",
        "--dir",
        "/var/tmp",
        "--dir",
        "/run/host",
        "--dir",
        run_dir.as_str(),
        "--setenv",
        "XDG_RUNTIME_DIR",
        run_dir.as_str(),
        "--symlink",
        "../run",
        "/var/run",
        "--ro-bind",
        "/sys/block",
        "/sys/block",
        "--ro-bind",
        "/sys/bus",
        "/sys/bus",
        "--ro-bind",
        "/sys/class",
        "/sys/class",
        "--ro-bind",
        "/sys/dev",
        "/sys/dev",
        "--ro-bind",
        "/sys/devices",
        "/sys/devices",
    ]);

    if flags.die_with_parent {
        stream.arg("--die-with-parent");
    }

    if flags.writable_etc {
        stream.args(["--dir", "/usr/etc", "--symlink", "usr/etc", "/etc"]);
    }

    stream.add_data("passwd", passwd.as_bytes(), "/etc/passwd")?;
    stream.add_data("group", group.as_bytes(), "/etc/group")?;

    if Path::new("/etc/machine-id").exists() {
        stream.args(["--ro-bind", "/etc/machine-id", "/etc/machine-id"]);
    } else if Path::new("/var/lib/dbus/machine-id").exists() {
        stream.args(["--ro-bind", "/var/lib/dbus/machine-id", "/etc/machine-id"]);
    }

    let etc = runtime_files.join("etc");
    if !flags.writable_etc && etc.is_dir() {
        const SPECIAL: &[&str] = &[
            "passwd",
            "group",
            "machine-id",
            "resolv.conf",
            "host.conf",
            "hosts",
            "localtime",
        ];
        let mut entries: Vec<_> = fs::read_dir(&etc)
            .map_err(LaunchError::file("opendir", &etc))?
            .flatten()
            .collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let name = entry.file_name();
            if SPECIAL.iter().any(|s| name.as_os_str() == *s) {
                continue;
            }
            let src = entry.path();
            let dest = Path::new("/etc").join(&name);
            let file_type = entry
                .file_type()
                .map_err(LaunchError::file("stat", &src))?;
            if file_type.is_symlink() {
                let target = fs::read_link(&src).map_err(LaunchError::file("readlink", &src))?;
                stream.arg("--symlink").arg(target).arg(&dest);
            } else {
                stream.arg("--bind").arg(&src).arg(&dest);
            }
        }
    }

    if let Some(app_id_dir) = app_id_dir {
        // Fixed paths for the per-app storage
        stream.arg("--bind").arg(app_id_dir.join("cache")).arg("/var/cache");
        stream.arg("--bind").arg(app_id_dir.join("data")).arg("/var/data");
        stream.arg("--bind").arg(app_id_dir.join("config")).arg("/var/config");
        stream.arg("--bind").arg(app_id_dir.join("cache/tmp")).arg("/var/tmp");
    }

    setup_usr_links(stream, runtime_files);

    let mut persona = PER_LINUX;
    if flags.set_personality && multiarch && is_linux32_arch(arch) {
        log::debug!("Setting personality linux32");
        persona = PER_LINUX32;
    }
    /* The executor inherits the personality over exec, so set it here and
     * also pin it in the filter. */
    apply_personality(persona);

    setup_seccomp(
        stream,
        &SeccompOptions {
            arch: Some(arch.to_string()),
            multiarch,
            devel,
            allowed_personality: persona,
        },
    )?;

    if !flags.writable_etc {
        add_monitor_path_args(stream);
    }

    Ok(())
}

/// Rewrite forwarded arguments between `@@` / `@@u` toggles: anything that
/// names a local file not visible in the sandbox is registered with the
/// document portal and replaced by its document path. Arguments the portal
/// cannot take are passed through unchanged.
pub fn forward_rest_args(
    portal: &dyn DocumentPortal,
    doc_mount_path: Option<&Path>,
    plan: &ExposurePlan,
    app_id: &str,
    file_forwarding: bool,
    args: &[String],
) -> Vec<String> {
    let mut out = Vec::new();
    let mut forwarding = false;
    let mut forwarding_uri = false;
    let can_forward = file_forwarding && doc_mount_path.is_some();

    if file_forwarding && doc_mount_path.is_none() {
        log::info!("Can't get document portal mount path, not forwarding files");
    }

    for arg in args {
        if file_forwarding && (arg == "@@" || arg == "@@u") {
            forwarding_uri = arg == "@@u";
            forwarding = !forwarding;
            continue;
        }

        let mut file: Option<PathBuf> = None;
        if can_forward && forwarding {
            if forwarding_uri {
                if let Some(rest) = arg.strip_prefix("file://") {
                    file = Some(PathBuf::from(rest));
                } else if arg.starts_with('/') {
                    file = Some(PathBuf::from(arg));
                }
            } else {
                let path = PathBuf::from(arg);
                file = Some(if path.is_absolute() {
                    path
                } else {
                    std::env::current_dir().map(|cwd| cwd.join(&path)).unwrap_or(path)
                });
            }
        }

        let (file, mount) = match (file, doc_mount_path) {
            (Some(file), Some(mount)) if !plan.is_visible(&file) => (file, mount),
            _ => {
                out.push(arg.clone());
                continue;
            }
        };

        match portal.add_document(&file, app_id) {
            Ok(doc_id) => {
                let basename = file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let doc_path = mount.join(&doc_id).join(basename);
                let rewritten = if forwarding_uri {
                    format!("file://{}", doc_path.display())
                } else {
                    doc_path.to_string_lossy().into_owned()
                };
                log::debug!("Forwarding file '{arg}' as '{rewritten}' to {app_id}");
                out.push(rewritten);
            }
            Err(e) => {
                log::warn!("Can't forward {arg}: {e}");
                out.push(arg.clone());
            }
        }
    }

    out
}

/// Run (or exec) an application per the full launch sequence. On a
/// successful foreground launch this never returns.
pub fn run_app(options: LaunchOptions) -> Result<()> {
    let app_ref = &options.app_ref;
    let is_app = app_ref.kind == RefKind::App;
    let use_ld_so_cache = true;

    // 1: deploy data for app and runtime
    let app_deploy = if is_app {
        Some(options.store.lookup(app_ref)?)
    } else {
        None
    };

    let runtime_spec = match &app_deploy {
        Some(deploy) => {
            let key = if options.flags.devel { KEY_SDK } else { KEY_RUNTIME };
            deploy
                .metadata
                .get_string(GROUP_APPLICATION, key)
                .ok_or_else(|| {
                    LaunchError::Deploy(format!("{app_ref} has no {key} in its metadata"))
                })?
        }
        None => format!("{}/{}/{}", app_ref.id, app_ref.arch, app_ref.branch),
    };
    let runtime_ref = Ref::runtime_from_spec(
        &runtime_spec,
        options.custom_runtime.as_deref(),
        options.custom_runtime_version.as_deref(),
    )?;
    let runtime_deploy = options.store.lookup(&runtime_ref)?;

    // 2: defaults -> runtime metadata -> app metadata -> overrides -> extra
    let mut context = Context::with_default_permissions();
    context.load_metadata(&runtime_deploy.metadata)?;
    if let Some(deploy) = &app_deploy {
        context.load_metadata(&deploy.metadata)?;
        if let Some(overrides) = options.store.load_overrides(&app_ref.id)? {
            context.merge(&overrides);
        }
    }
    if let Some(extra) = &options.extra_context {
        context.merge(extra);
    }

    let devel = options.flags.devel || context.features.has(FEATURE_DEVEL);
    let multiarch = context.features.has(FEATURE_MULTIARCH);

    // 3: per-app data directory
    let app_id_dir = if is_app {
        Some(ensure_data_dir(&app_ref.id)?)
    } else {
        None
    };

    let mut env = minimal_env(devel, use_ld_so_cache);
    apply_env_vars(&mut env, &context);

    // 4: runtime and app mounts plus extensions
    let runtime_files = &runtime_deploy.files;
    let mut stream = ArgStream::new();
    stream.arg("--ro-bind").arg(runtime_files).arg("/usr");
    stream.args(["--lock-file", "/usr/.ref"]);

    let app_files = app_deploy.as_ref().map(|d| d.files.clone());
    match &app_files {
        Some(files) => {
            stream.arg("--ro-bind").arg(files).arg("/app");
            stream.args(["--lock-file", "/app/.ref"]);
        }
        None => {
            stream.args(["--dir", "/app"]);
        }
    }

    let app_extensions = match &app_deploy {
        Some(deploy) => {
            let extensions = list_extensions(
                &deploy.metadata,
                &app_ref.arch,
                &app_ref.branch,
                &options.store,
                &deploy.files,
            );
            add_extension_args(&mut stream, &mut env, &extensions, app_ref, use_ld_so_cache)?
        }
        None => String::new(),
    };
    let runtime_extensions = {
        let extensions = list_extensions(
            &runtime_deploy.metadata,
            &runtime_ref.arch,
            &runtime_ref.branch,
            &options.store,
            runtime_files,
        );
        add_extension_args(&mut stream, &mut env, &extensions, &runtime_ref, use_ld_so_cache)?
    };

    // 5: generate an ld.so.conf only when the runtime ships an empty one
    let generate_ld_so_conf = fs::symlink_metadata(runtime_files.join("etc/ld.so.conf"))
        .map(|meta| meta.file_type().is_file() && meta.len() == 0)
        .unwrap_or(true);

    // 6: linker cache from the partial argument stream
    let key = cache_key(
        app_deploy.as_ref().map(|d| d.commit.as_str()),
        &runtime_deploy.commit,
        &app_extensions,
        &runtime_extensions,
    );
    let ldconfig_env = minimal_env(false, false);
    let mut usr_links = ArgStream::new();
    setup_usr_links(&mut usr_links, runtime_files);
    let ld_so_fd = ensure_ld_cache(
        &LdCacheConfig {
            app_id_dir: app_id_dir.as_deref(),
            generate_ld_so_conf,
            executor: &options.executor,
            env: &ldconfig_env,
        },
        &stream,
        &usr_links,
        &key,
    )?;

    // 7: base sandbox
    let uid = nix::unistd::Uid::current().as_raw();
    setup_base_argv(
        &mut stream,
        runtime_files,
        app_id_dir.as_deref(),
        &app_ref.arch,
        &options.flags,
        multiarch,
        devel,
        uid,
    )?;

    if generate_ld_so_conf {
        add_ld_so_conf(&mut stream)?;
    }

    // 8: linker cache, instance info, document portal mount
    stream.arg_fd_path("--ro-bind-data", ld_so_fd, "/etc/ld.so.cache");

    let runtime_ref_name = runtime_ref.to_string();
    let info = AppInfo {
        app_id: &app_ref.id,
        runtime_ref: &runtime_ref_name,
        app_files: app_files.as_deref(),
        app_commit: app_deploy.as_ref().map(|d| d.commit.as_str()),
        app_extensions: &app_extensions,
        runtime_files,
        runtime_commit: &runtime_deploy.commit,
        runtime_extensions: &runtime_extensions,
        branch: Some(&app_ref.branch),
        context: &context,
    };
    let app_info_path = add_app_info_args(&mut stream, &info, uid)?;

    let services = SessionServices::connect();

    let doc_mount_path = if options.flags.no_documents_portal {
        None
    } else {
        services.document_mount_point()
    };
    if let Some(mount) = &doc_mount_path {
        let src = mount.join("by-app").join(&app_ref.id);
        let dst = format!("/run/user/{uid}/doc");
        stream.arg("--bind").arg(&src).arg(&dst);
    }

    // 9: context environment: exposure, sockets, buses
    let a11y_address = if options.flags.no_a11y_bus_proxy {
        None
    } else {
        services.a11y_bus_address()
    };
    let env_opts = EnvironmentOptions::from_host(
        &app_ref.id,
        app_id_dir.as_deref(),
        a11y_address,
        options.flags.clone(),
    )?;
    let (plan, proxy_plan) = add_environment_args(&mut stream, &mut env, &context, &env_opts)?;

    add_journal_args(&mut stream);
    add_font_path_args(&mut stream, &env_opts.home_dir);
    add_icon_path_args(&mut stream);

    stream.args([
        "--symlink",
        "/app/lib/debug/source",
        "/run/build",
        "--symlink",
        "/usr/lib/debug/source",
        "/run/build-runtime",
    ]);

    // 10: command selection
    let command = match &options.custom_command {
        Some(command) => command.clone(),
        None => match &app_deploy {
            Some(deploy) => deploy
                .metadata
                .get_string(GROUP_APPLICATION, KEY_COMMAND)
                .unwrap_or_else(|| "/bin/sh".to_string()),
            None => "/bin/sh".to_string(),
        },
    };

    /* 11: cgroup scope placement must happen before the proxy spawns so
     * the proxy lands in the app's scope too. Nothing depends on it, so
     * failure is only logged. */
    if let Err(e) = services.start_transient_unit(&app_ref.id) {
        log::debug!("Failed to run in transient scope: {e}");
    }

    // 12: bus proxies, synchronized on the one-byte rendezvous
    spawn_proxy(
        &mut stream,
        proxy_plan,
        &app_info_path,
        &options.executor,
        &env_opts.runtime_dir,
    )?;

    // 13: final invocation
    let args_fd = stream.serialized_args_fd()?;
    let mut real_argv: Vec<OsString> = vec![
        options.executor.clone().into(),
        "--args".into(),
        args_fd.as_raw_fd().to_string().into(),
        command.clone().into(),
    ];
    for arg in forward_rest_args(
        &services,
        doc_mount_path.as_deref(),
        &plan,
        &app_ref.id,
        options.flags.file_forwarding,
        &options.forwarded_args,
    ) {
        real_argv.push(arg.into());
    }
    stream.hold_fd(args_fd);

    log::debug!(
        "Running '{}'",
        real_argv
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    );

    let mut command = Command::new(&real_argv[0]);
    command.args(&real_argv[1..]).env_clear().envs(&env);

    if options.flags.background {
        let fd_numbers: Vec<i32> = stream.fds_list().iter().map(|fd| fd.as_raw_fd()).collect();
        unsafe {
            command.pre_exec(move || {
                for fd in &fd_numbers {
                    if libc::fcntl(*fd, libc::F_SETFD, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
        command
            .spawn()
            .map_err(|e| LaunchError::Sandbox(format!("Unable to start app: {e}")))?;
        Ok(())
    } else {
        clear_cloexec(stream.fds_list())?;
        let err = command.exec();
        Err(LaunchError::Sandbox(format!("Unable to start app: {err}")))
    }
}
