/// Command-line surface for appbox-run.
use anyhow::{bail, Context as _, Result};
use clap::Parser;
use std::path::PathBuf;

use crate::context::Context;
use crate::deploy::{default_arch, DeployStore, Ref};
use crate::launcher::{run_app, LaunchFlags, LaunchOptions};

const DEFAULT_BRANCH: &str = "master";

#[derive(Parser, Debug)]
#[command(
    name = "appbox-run",
    author,
    version,
    about = "Run an application in its sandbox"
)]
struct RunCli {
    /// Share a subsystem with the host (network, ipc)
    #[arg(long, value_name = "SHARE")]
    share: Vec<String>,
    /// Unshare a subsystem from the host
    #[arg(long, value_name = "SHARE")]
    unshare: Vec<String>,
    /// Expose a socket to the app (x11, wayland, pulseaudio, session-bus, system-bus)
    #[arg(long, value_name = "SOCKET")]
    socket: Vec<String>,
    /// Don't expose a socket to the app
    #[arg(long, value_name = "SOCKET")]
    nosocket: Vec<String>,
    /// Expose a device to the app (dri, all, kvm)
    #[arg(long, value_name = "DEVICE")]
    device: Vec<String>,
    /// Don't expose a device to the app
    #[arg(long, value_name = "DEVICE")]
    nodevice: Vec<String>,
    /// Allow a feature (devel, multiarch)
    #[arg(long, value_name = "FEATURE")]
    allow: Vec<String>,
    /// Don't allow a feature
    #[arg(long, value_name = "FEATURE")]
    disallow: Vec<String>,
    /// Expose a filesystem location to the app (:ro for read-only, :create to create)
    #[arg(long, value_name = "FILESYSTEM[:ro|:rw|:create]")]
    filesystem: Vec<String>,
    /// Don't expose a filesystem location to the app
    #[arg(long, value_name = "FILESYSTEM")]
    nofilesystem: Vec<String>,
    /// Set an environment variable
    #[arg(long, value_name = "VAR=VALUE")]
    env: Vec<String>,
    /// Allow the app to own a name on the session bus
    #[arg(long = "own-name", value_name = "DBUS_NAME")]
    own_name: Vec<String>,
    /// Allow the app to talk to a name on the session bus
    #[arg(long = "talk-name", value_name = "DBUS_NAME")]
    talk_name: Vec<String>,
    /// Allow the app to own a name on the system bus
    #[arg(long = "system-own-name", value_name = "DBUS_NAME")]
    system_own_name: Vec<String>,
    /// Allow the app to talk to a name on the system bus
    #[arg(long = "system-talk-name", value_name = "DBUS_NAME")]
    system_talk_name: Vec<String>,
    /// Add a generic policy option
    #[arg(long = "add-policy", value_name = "SUBSYSTEM.KEY=VALUE")]
    add_policy: Vec<String>,
    /// Remove a generic policy option
    #[arg(long = "remove-policy", value_name = "SUBSYSTEM.KEY=VALUE")]
    remove_policy: Vec<String>,
    /// Persist a home-relative directory
    #[arg(long, value_name = "FILENAME")]
    persist: Vec<String>,

    /// Use a different runtime
    #[arg(long, value_name = "RUNTIME")]
    runtime: Option<String>,
    /// Use a different runtime version
    #[arg(long = "runtime-version", value_name = "VERSION")]
    runtime_version: Option<String>,
    /// Run this command instead of the one from the app metadata
    #[arg(long, value_name = "COMMAND")]
    command: Option<String>,
    /// Branch to run
    #[arg(long, value_name = "BRANCH")]
    branch: Option<String>,
    /// Architecture to run
    #[arg(long, value_name = "ARCH")]
    arch: Option<String>,
    /// Use the devel runtime and grant debugging capabilities
    #[arg(short = 'd', long)]
    devel: bool,
    /// Fork before starting the app instead of replacing this process
    #[arg(long)]
    background: bool,
    /// Enable @@-delimited document forwarding for file arguments
    #[arg(long = "file-forwarding")]
    file_forwarding: bool,
    /// Log session-bus traffic in the proxy
    #[arg(long = "log-session-bus")]
    log_session_bus: bool,
    /// Log system-bus traffic in the proxy
    #[arg(long = "log-system-bus")]
    log_system_bus: bool,
    /// Log a11y-bus traffic in the proxy
    #[arg(long = "log-a11y-bus")]
    log_a11y_bus: bool,
    /// Kill the sandbox when this process dies
    #[arg(long = "die-with-parent")]
    die_with_parent: bool,

    /// Application id or full ref
    #[arg(value_name = "APP")]
    app: String,
    /// Arguments passed to the application
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn context_from_cli(cli: &RunCli) -> Result<Context> {
    let mut context = Context::new();

    for value in &cli.share {
        context.share(value)?;
    }
    for value in &cli.unshare {
        context.unshare(value)?;
    }
    for value in &cli.socket {
        context.socket(value)?;
    }
    for value in &cli.nosocket {
        context.nosocket(value)?;
    }
    for value in &cli.device {
        context.device(value)?;
    }
    for value in &cli.nodevice {
        context.nodevice(value)?;
    }
    for value in &cli.allow {
        context.allow(value)?;
    }
    for value in &cli.disallow {
        context.disallow(value)?;
    }
    for value in &cli.filesystem {
        context.filesystem(value)?;
    }
    for value in &cli.nofilesystem {
        context.nofilesystem(value)?;
    }
    for value in &cli.env {
        context.env(value)?;
    }
    for value in &cli.own_name {
        context.own_name(value)?;
    }
    for value in &cli.talk_name {
        context.talk_name(value)?;
    }
    for value in &cli.system_own_name {
        context.system_own_name(value)?;
    }
    for value in &cli.system_talk_name {
        context.system_talk_name(value)?;
    }
    for value in &cli.add_policy {
        context.add_policy(value)?;
    }
    for value in &cli.remove_policy {
        context.remove_policy(value)?;
    }
    for value in &cli.persist {
        context.persist(value);
    }

    Ok(context)
}

fn resolve_app_ref(cli: &RunCli) -> Result<Ref> {
    if cli.app.contains('/') {
        let parsed = Ref::parse(&cli.app)?;
        if cli.branch.is_some() || cli.arch.is_some() {
            bail!("--branch and --arch cannot be combined with a full ref");
        }
        return Ok(parsed);
    }

    let arch = cli.arch.as_deref().unwrap_or_else(|| default_arch());
    let branch = cli.branch.as_deref().unwrap_or(DEFAULT_BRANCH);
    Ok(Ref::app(&cli.app, arch, branch))
}

/// The container executor binary, overridable for development setups.
fn executor_path() -> PathBuf {
    std::env::var_os("APPBOX_BWRAP")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("bwrap"))
}

pub fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = RunCli::parse();
    let extra_context = context_from_cli(&cli)?;
    let app_ref = resolve_app_ref(&cli)?;

    let options = LaunchOptions {
        app_ref,
        store: DeployStore::default_locations(),
        extra_context: Some(extra_context),
        custom_runtime: cli.runtime.clone(),
        custom_runtime_version: cli.runtime_version.clone(),
        custom_command: cli.command.clone(),
        forwarded_args: cli.args.clone(),
        flags: LaunchFlags {
            devel: cli.devel,
            background: cli.background,
            file_forwarding: cli.file_forwarding,
            log_session_bus: cli.log_session_bus,
            log_system_bus: cli.log_system_bus,
            log_a11y_bus: cli.log_a11y_bus,
            die_with_parent: cli.die_with_parent,
            set_personality: true,
            ..Default::default()
        },
        executor: executor_path(),
    };

    run_app(options).context("launch failed")?;
    Ok(())
}
