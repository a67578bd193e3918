/// Permission context model: tri-state capability sets plus the keyed
/// permission tables (environment, persistent paths, filesystems, bus
/// policies, generic policies) and their parse/merge/serialize operations.
use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::keyfile::KeyFile;
use crate::types::LaunchError;

pub const GROUP_CONTEXT: &str = "Context";
pub const GROUP_SESSION_BUS_POLICY: &str = "Session Bus Policy";
pub const GROUP_SYSTEM_BUS_POLICY: &str = "System Bus Policy";
pub const GROUP_ENVIRONMENT: &str = "Environment";
pub const GROUP_PREFIX_POLICY: &str = "Policy ";

pub const KEY_SHARED: &str = "shared";
pub const KEY_SOCKETS: &str = "sockets";
pub const KEY_DEVICES: &str = "devices";
pub const KEY_FEATURES: &str = "features";
pub const KEY_FILESYSTEMS: &str = "filesystems";
pub const KEY_PERSISTENT: &str = "persistent";

pub const SHARE_NETWORK: u32 = 1 << 0;
pub const SHARE_IPC: u32 = 1 << 1;

pub const SOCKET_X11: u32 = 1 << 0;
pub const SOCKET_WAYLAND: u32 = 1 << 1;
pub const SOCKET_PULSEAUDIO: u32 = 1 << 2;
pub const SOCKET_SESSION_BUS: u32 = 1 << 3;
pub const SOCKET_SYSTEM_BUS: u32 = 1 << 4;

pub const DEVICE_DRI: u32 = 1 << 0;
pub const DEVICE_ALL: u32 = 1 << 1;
pub const DEVICE_KVM: u32 = 1 << 2;

pub const FEATURE_DEVEL: u32 = 1 << 0;
pub const FEATURE_MULTIARCH: u32 = 1 << 1;

/* Same order as the bit constants above */
const SHARE_NAMES: &[&str] = &["network", "ipc"];
const SOCKET_NAMES: &[&str] = &["x11", "wayland", "pulseaudio", "session-bus", "system-bus"];
const DEVICE_NAMES: &[&str] = &["dri", "all", "kvm"];
const FEATURE_NAMES: &[&str] = &["devel", "multiarch"];

const POLICY_NAMES: &[&str] = &["none", "see", "filtered", "talk", "own"];

/// Valid xdg-dir prefixes for filesystem specs. `xdg-run` additionally
/// requires a non-empty subpath.
const XDG_DIR_PREFIXES: &[&str] = &[
    "xdg-desktop",
    "xdg-documents",
    "xdg-download",
    "xdg-music",
    "xdg-pictures",
    "xdg-public-share",
    "xdg-templates",
    "xdg-videos",
    "xdg-data",
    "xdg-cache",
    "xdg-config",
];

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Unknown {kind} type {value}, valid types are: {valid_values}")]
    UnknownName {
        kind: &'static str,
        value: String,
        valid_values: String,
    },

    #[error("Invalid dbus name {0}")]
    BadBusName(String),

    #[error("Unknown filesystem location {0}, valid locations are: host, home, xdg-*[/...], ~/dir, /dir")]
    BadFilesystem(String),

    #[error("Invalid env format {0}")]
    BadEnvFormat(String),

    #[error("Malformed metadata: {0}")]
    BadMetadata(String),

    #[error("Policy arguments must be in the form SUBSYSTEM.KEY=[!]VALUE: {0}")]
    BadPolicyArg(String),

    #[error("Policy values can't start with \"!\": {0}")]
    NegatedPolicyValue(String),
}

impl From<ContextError> for LaunchError {
    fn from(err: ContextError) -> Self {
        LaunchError::Config(err.to_string())
    }
}

/// One tri-state capability bitmask: a bit is granted iff set in both
/// `enabled` and `valid`, denied iff set in `valid` only, and unspecified
/// iff clear in `valid`. The split is what lets a later merge override in
/// either direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapSet {
    pub enabled: u32,
    pub valid: u32,
}

impl CapSet {
    pub fn add(&mut self, mask: u32) {
        self.valid |= mask;
        self.enabled |= mask;
    }

    pub fn remove(&mut self, mask: u32) {
        self.valid |= mask;
        self.enabled &= !mask;
    }

    pub fn merge(&mut self, other: CapSet) {
        self.enabled &= !other.valid;
        self.enabled |= other.enabled;
        self.valid |= other.valid;
    }

    pub fn has(&self, mask: u32) -> bool {
        self.enabled & mask != 0
    }

    /// Restrict to the valid bits and, when flattening, forget the denied
    /// bits entirely (the result is self-contained and never merged again).
    fn normalized(&self, flatten: bool) -> CapSet {
        let enabled = self.enabled & self.valid;
        let valid = if flatten { enabled } else { self.valid };
        CapSet { enabled, valid }
    }

    fn to_strings(self, names: &[&str]) -> Vec<String> {
        let mut out = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let mask = 1 << i;
            if self.valid & mask != 0 {
                if self.enabled & mask != 0 {
                    out.push((*name).to_string());
                } else {
                    out.push(format!("!{name}"));
                }
            }
        }
        out
    }

    fn to_args(self, names: &[&str], enable_arg: &str, disable_arg: &str, args: &mut Vec<String>) {
        for (i, name) in names.iter().enumerate() {
            let mask = 1 << i;
            if self.valid & mask != 0 {
                if self.enabled & mask != 0 {
                    args.push(format!("{enable_arg}={name}"));
                } else {
                    args.push(format!("{disable_arg}={name}"));
                }
            }
        }
    }
}

fn bitmask_from_string(kind: &'static str, value: &str, names: &[&str]) -> Result<u32, ContextError> {
    for (i, name) in names.iter().enumerate() {
        if *name == value {
            return Ok(1 << i);
        }
    }
    Err(ContextError::UnknownName {
        kind,
        value: value.to_string(),
        valid_values: names.join(", "),
    })
}

/// Bus name policies in numerical order of increasing privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BusPolicy {
    None = 0,
    See = 1,
    Filtered = 2,
    Talk = 3,
    Own = 4,
}

impl BusPolicy {
    pub fn from_string(value: &str) -> Result<Self, ContextError> {
        match value {
            "none" => Ok(BusPolicy::None),
            "see" => Ok(BusPolicy::See),
            "filtered" => Ok(BusPolicy::Filtered),
            "talk" => Ok(BusPolicy::Talk),
            "own" => Ok(BusPolicy::Own),
            _ => Err(ContextError::UnknownName {
                kind: "policy",
                value: value.to_string(),
                valid_values: POLICY_NAMES.join(", "),
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BusPolicy::See => "see",
            BusPolicy::Talk => "talk",
            BusPolicy::Own => "own",
            _ => "none",
        }
    }
}

/// Access mode for a granted filesystem path, in numerical order of
/// increasing privilege. Create implies read-write plus creation of the
/// path when missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilesystemMode {
    ReadOnly = 1,
    ReadWrite = 2,
    Create = 3,
}

/// Split the optional `:ro` / `:rw` / `:create` suffix off a filesystem
/// spec. The default mode is read-write.
pub fn parse_filesystem_flags(spec: &str) -> (String, FilesystemMode) {
    if let Some(fs) = spec.strip_suffix(":ro") {
        (fs.to_string(), FilesystemMode::ReadOnly)
    } else if let Some(fs) = spec.strip_suffix(":rw") {
        (fs.to_string(), FilesystemMode::ReadWrite)
    } else if let Some(fs) = spec.strip_suffix(":create") {
        (fs.to_string(), FilesystemMode::Create)
    } else {
        (spec.to_string(), FilesystemMode::ReadWrite)
    }
}

/// Check whether a filesystem spec names a known xdg dir. Returns the
/// prefix and remaining subpath when it does.
pub fn split_xdg_prefix(filesystem: &str) -> Option<(&str, &str)> {
    let (prefix, rest) = match filesystem.find('/') {
        Some(idx) => (&filesystem[..idx], filesystem[idx..].trim_start_matches('/')),
        None => (filesystem, ""),
    };

    if XDG_DIR_PREFIXES.contains(&prefix) {
        return Some((prefix, rest));
    }
    /* xdg-run without a subpath cannot work, the whole runtime dir is
     * already managed by the launcher */
    if prefix == "xdg-run" && !rest.is_empty() {
        return Some((prefix, rest));
    }
    None
}

fn verify_filesystem(spec: &str) -> Result<(), ContextError> {
    let (fs, _) = parse_filesystem_flags(spec);
    if fs == "host" || fs == "home" {
        return Ok(());
    }
    if split_xdg_prefix(&fs).is_some() {
        return Ok(());
    }
    if fs.starts_with("~/") || fs.starts_with('/') {
        return Ok(());
    }
    Err(ContextError::BadFilesystem(fs))
}

/// Validate a well-known bus name pattern. A trailing `.*` is allowed;
/// unique (":"-prefixed) connection names are not.
pub fn verify_dbus_name(name: &str) -> Result<(), ContextError> {
    let name_part = name.strip_suffix(".*").unwrap_or(name);

    let valid = name_part.len() <= 255
        && !name_part.starts_with(':')
        && name_part.split('.').count() >= 2
        && name_part.split('.').all(|element| {
            !element.is_empty()
                && !element.starts_with(|c: char| c.is_ascii_digit())
                && element
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        });

    if valid {
        Ok(())
    } else {
        Err(ContextError::BadBusName(name.to_string()))
    }
}

fn parse_negated(value: &str) -> (&str, bool) {
    match value.strip_prefix('!') {
        Some(rest) => (rest, true),
        None => (value, false),
    }
}

/// The full permission context. Constructed empty, grown by load/merge
/// operations, consumed once by the launcher.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    pub shares: CapSet,
    pub sockets: CapSet,
    pub devices: CapSet,
    pub features: CapSet,
    /// Name to value; an empty value means "unset in the sandbox".
    pub env_vars: BTreeMap<String, String>,
    /// Home-relative paths persisted into the per-app data dir.
    pub persistent: BTreeSet<String>,
    /// Path spec to mode; `None` is the negation sentinel ("deny even if a
    /// broader rule granted it").
    pub filesystems: BTreeMap<String, Option<FilesystemMode>>,
    pub session_bus_policy: BTreeMap<String, BusPolicy>,
    pub system_bus_policy: BTreeMap<String, BusPolicy>,
    /// "subsystem.key" to ordered values; a leading `!` marks a removal
    /// that must survive later merges.
    pub generic_policy: BTreeMap<String, Vec<String>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// The permissions every app gets before any metadata is loaded.
    pub fn with_default_permissions() -> Self {
        let mut context = Self::new();
        context
            .session_bus_policy
            .insert("org.freedesktop.portal.*".to_string(), BusPolicy::Talk);
        context
    }

    pub fn share(&mut self, name: &str) -> Result<(), ContextError> {
        self.shares.add(bitmask_from_string("share", name, SHARE_NAMES)?);
        Ok(())
    }

    pub fn unshare(&mut self, name: &str) -> Result<(), ContextError> {
        self.shares.remove(bitmask_from_string("share", name, SHARE_NAMES)?);
        Ok(())
    }

    pub fn socket(&mut self, name: &str) -> Result<(), ContextError> {
        self.sockets.add(bitmask_from_string("socket", name, SOCKET_NAMES)?);
        Ok(())
    }

    pub fn nosocket(&mut self, name: &str) -> Result<(), ContextError> {
        self.sockets.remove(bitmask_from_string("socket", name, SOCKET_NAMES)?);
        Ok(())
    }

    pub fn device(&mut self, name: &str) -> Result<(), ContextError> {
        self.devices.add(bitmask_from_string("device", name, DEVICE_NAMES)?);
        Ok(())
    }

    pub fn nodevice(&mut self, name: &str) -> Result<(), ContextError> {
        self.devices.remove(bitmask_from_string("device", name, DEVICE_NAMES)?);
        Ok(())
    }

    pub fn allow(&mut self, name: &str) -> Result<(), ContextError> {
        self.features.add(bitmask_from_string("feature", name, FEATURE_NAMES)?);
        Ok(())
    }

    pub fn disallow(&mut self, name: &str) -> Result<(), ContextError> {
        self.features.remove(bitmask_from_string("feature", name, FEATURE_NAMES)?);
        Ok(())
    }

    pub fn filesystem(&mut self, spec: &str) -> Result<(), ContextError> {
        verify_filesystem(spec)?;
        let (fs, mode) = parse_filesystem_flags(spec);
        self.filesystems.insert(fs, Some(mode));
        Ok(())
    }

    pub fn nofilesystem(&mut self, spec: &str) -> Result<(), ContextError> {
        verify_filesystem(spec)?;
        let (fs, _) = parse_filesystem_flags(spec);
        self.filesystems.insert(fs, None);
        Ok(())
    }

    pub fn env(&mut self, var: &str) -> Result<(), ContextError> {
        match var.split_once('=') {
            Some((name, value)) if !name.is_empty() => {
                self.env_vars.insert(name.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(ContextError::BadEnvFormat(var.to_string())),
        }
    }

    pub fn own_name(&mut self, name: &str) -> Result<(), ContextError> {
        verify_dbus_name(name)?;
        self.session_bus_policy.insert(name.to_string(), BusPolicy::Own);
        Ok(())
    }

    pub fn talk_name(&mut self, name: &str) -> Result<(), ContextError> {
        verify_dbus_name(name)?;
        self.session_bus_policy.insert(name.to_string(), BusPolicy::Talk);
        Ok(())
    }

    pub fn system_own_name(&mut self, name: &str) -> Result<(), ContextError> {
        verify_dbus_name(name)?;
        self.system_bus_policy.insert(name.to_string(), BusPolicy::Own);
        Ok(())
    }

    pub fn system_talk_name(&mut self, name: &str) -> Result<(), ContextError> {
        verify_dbus_name(name)?;
        self.system_bus_policy.insert(name.to_string(), BusPolicy::Talk);
        Ok(())
    }

    pub fn persist(&mut self, path: &str) {
        self.persistent.insert(path.to_string());
    }

    fn parse_policy_arg(arg: &str) -> Result<(String, String), ContextError> {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| ContextError::BadPolicyArg(arg.to_string()))?;
        if !key.contains('.') {
            return Err(ContextError::BadPolicyArg(arg.to_string()));
        }
        if value.starts_with('!') {
            return Err(ContextError::NegatedPolicyValue(arg.to_string()));
        }
        Ok((key.to_string(), value.to_string()))
    }

    pub fn add_policy(&mut self, arg: &str) -> Result<(), ContextError> {
        let (key, value) = Self::parse_policy_arg(arg)?;
        self.apply_generic_policy(&key, &value);
        Ok(())
    }

    pub fn remove_policy(&mut self, arg: &str) -> Result<(), ContextError> {
        let (key, value) = Self::parse_policy_arg(arg)?;
        self.apply_generic_policy(&key, &format!("!{value}"));
        Ok(())
    }

    /// Apply one generic policy value: remove every existing entry whose
    /// raw text (ignoring a leading `!`) equals the new value's raw text,
    /// then append the new value verbatim. A later `!X` therefore shadows
    /// an earlier `X` and vice versa, and re-applying is idempotent.
    pub fn apply_generic_policy(&mut self, key: &str, value: &str) {
        debug_assert!(key.contains('.'));

        let values = self.generic_policy.entry(key.to_string()).or_default();
        let (bare_new, _) = parse_negated(value);
        values.retain(|old| parse_negated(old).0 != bare_new);
        values.push(value.to_string());
    }

    /// Merge `other` on top of this context. Capability sets use the
    /// tri-state formula; keyed tables are last-writer-wins per key except
    /// generic policies, which go through apply_generic_policy.
    pub fn merge(&mut self, other: &Context) {
        self.shares.merge(other.shares);
        self.sockets.merge(other.sockets);
        self.devices.merge(other.devices);
        self.features.merge(other.features);

        for (k, v) in &other.env_vars {
            self.env_vars.insert(k.clone(), v.clone());
        }
        for p in &other.persistent {
            self.persistent.insert(p.clone());
        }
        for (k, v) in &other.filesystems {
            self.filesystems.insert(k.clone(), *v);
        }
        for (k, v) in &other.session_bus_policy {
            self.session_bus_policy.insert(k.clone(), *v);
        }
        for (k, v) in &other.system_bus_policy {
            self.system_bus_policy.insert(k.clone(), *v);
        }
        for (key, values) in &other.generic_policy {
            for value in values {
                self.apply_generic_policy(key, value);
            }
        }
    }

    /// Merge the Context, bus policy, Environment and `Policy *` groups of
    /// a metadata key-file into this context. This is a merge, not a
    /// replace.
    pub fn load_metadata(&mut self, metakey: &KeyFile) -> Result<(), ContextError> {
        if let Some(shares) = metakey.get_string_list(GROUP_CONTEXT, KEY_SHARED) {
            for item in &shares {
                let (name, remove) = parse_negated(item);
                let mask = bitmask_from_string("share", name, SHARE_NAMES)?;
                if remove {
                    self.shares.remove(mask);
                } else {
                    self.shares.add(mask);
                }
            }
        }

        if let Some(sockets) = metakey.get_string_list(GROUP_CONTEXT, KEY_SOCKETS) {
            for item in &sockets {
                let (name, remove) = parse_negated(item);
                let mask = bitmask_from_string("socket", name, SOCKET_NAMES)?;
                if remove {
                    self.sockets.remove(mask);
                } else {
                    self.sockets.add(mask);
                }
            }
        }

        if let Some(devices) = metakey.get_string_list(GROUP_CONTEXT, KEY_DEVICES) {
            for item in &devices {
                let (name, remove) = parse_negated(item);
                let mask = bitmask_from_string("device", name, DEVICE_NAMES)?;
                if remove {
                    self.devices.remove(mask);
                } else {
                    self.devices.add(mask);
                }
            }
        }

        if let Some(features) = metakey.get_string_list(GROUP_CONTEXT, KEY_FEATURES) {
            for item in &features {
                let (name, remove) = parse_negated(item);
                let mask = bitmask_from_string("feature", name, FEATURE_NAMES)?;
                if remove {
                    self.features.remove(mask);
                } else {
                    self.features.add(mask);
                }
            }
        }

        if let Some(filesystems) = metakey.get_string_list(GROUP_CONTEXT, KEY_FILESYSTEMS) {
            for item in &filesystems {
                let (fs, remove) = parse_negated(item);
                if remove {
                    self.nofilesystem(fs)?;
                } else {
                    self.filesystem(fs)?;
                }
            }
        }

        if let Some(persistent) = metakey.get_string_list(GROUP_CONTEXT, KEY_PERSISTENT) {
            for path in &persistent {
                self.persist(path);
            }
        }

        if metakey.has_group(GROUP_SESSION_BUS_POLICY) {
            for key in metakey.keys(GROUP_SESSION_BUS_POLICY) {
                verify_dbus_name(&key)?;
                let value = metakey
                    .get_string(GROUP_SESSION_BUS_POLICY, &key)
                    .unwrap_or_default();
                let policy = BusPolicy::from_string(&value)?;
                self.session_bus_policy.insert(key, policy);
            }
        }

        if metakey.has_group(GROUP_SYSTEM_BUS_POLICY) {
            for key in metakey.keys(GROUP_SYSTEM_BUS_POLICY) {
                verify_dbus_name(&key)?;
                let value = metakey
                    .get_string(GROUP_SYSTEM_BUS_POLICY, &key)
                    .unwrap_or_default();
                let policy = BusPolicy::from_string(&value)?;
                self.system_bus_policy.insert(key, policy);
            }
        }

        if metakey.has_group(GROUP_ENVIRONMENT) {
            for key in metakey.keys(GROUP_ENVIRONMENT) {
                let value = metakey.get_string(GROUP_ENVIRONMENT, &key).unwrap_or_default();
                self.env_vars.insert(key, value);
            }
        }

        let policy_groups: Vec<String> = metakey
            .groups()
            .filter(|g| g.starts_with(GROUP_PREFIX_POLICY))
            .map(|g| g.to_string())
            .collect();
        for group in policy_groups {
            let subsystem = &group[GROUP_PREFIX_POLICY.len()..];
            for key in metakey.keys(&group) {
                let policy_key = format!("{subsystem}.{key}");
                if let Some(values) = metakey.get_string_list(&group, &key) {
                    for value in &values {
                        self.apply_generic_policy(&policy_key, value);
                    }
                }
            }
        }

        Ok(())
    }

    /// Parse a metadata key-file into a fresh context.
    pub fn parse(metakey: &KeyFile) -> Result<Self, ContextError> {
        let mut context = Context::new();
        context.load_metadata(metakey)?;
        Ok(context)
    }

    /// Same grammar as metadata; intended to be merged on top of it.
    pub fn load_overrides(data: &str) -> Result<Self, ContextError> {
        let metakey =
            KeyFile::parse(data).map_err(|e| ContextError::BadMetadata(e.to_string()))?;
        Context::parse(&metakey)
    }

    /// Write this context into a metadata key-file. With `flatten` the
    /// tri-state representation is dropped (no denied bits, no `!` generic
    /// policy entries): the result is self-contained and never merged on
    /// top of anything.
    pub fn save_metadata(&self, flatten: bool, metakey: &mut KeyFile) {
        let shares = self.shares.normalized(flatten).to_strings(SHARE_NAMES);
        let sockets = self.sockets.normalized(flatten).to_strings(SOCKET_NAMES);
        let devices = self.devices.normalized(flatten).to_strings(DEVICE_NAMES);
        let features = self.features.normalized(flatten).to_strings(FEATURE_NAMES);

        for (key, values) in [
            (KEY_SHARED, shares),
            (KEY_SOCKETS, sockets),
            (KEY_DEVICES, devices),
            (KEY_FEATURES, features),
        ] {
            if values.is_empty() {
                metakey.remove_key(GROUP_CONTEXT, key);
            } else {
                metakey.set_string_list(GROUP_CONTEXT, key, &values);
            }
        }

        if self.filesystems.is_empty() {
            metakey.remove_key(GROUP_CONTEXT, KEY_FILESYSTEMS);
        } else {
            let mut specs = Vec::new();
            for (fs, mode) in &self.filesystems {
                match mode {
                    Some(FilesystemMode::ReadOnly) => specs.push(format!("{fs}:ro")),
                    Some(FilesystemMode::Create) => specs.push(format!("{fs}:create")),
                    Some(FilesystemMode::ReadWrite) => specs.push(fs.clone()),
                    None => {
                        if !flatten {
                            specs.push(format!("!{fs}"));
                        }
                    }
                }
            }
            metakey.set_string_list(GROUP_CONTEXT, KEY_FILESYSTEMS, &specs);
        }

        if self.persistent.is_empty() {
            metakey.remove_key(GROUP_CONTEXT, KEY_PERSISTENT);
        } else {
            let paths: Vec<&String> = self.persistent.iter().collect();
            metakey.set_string_list(GROUP_CONTEXT, KEY_PERSISTENT, &paths);
        }

        metakey.remove_group(GROUP_SESSION_BUS_POLICY);
        for (name, policy) in &self.session_bus_policy {
            if *policy > BusPolicy::None {
                metakey.set_string(GROUP_SESSION_BUS_POLICY, name, policy.as_str());
            }
        }

        metakey.remove_group(GROUP_SYSTEM_BUS_POLICY);
        for (name, policy) in &self.system_bus_policy {
            if *policy > BusPolicy::None {
                metakey.set_string(GROUP_SYSTEM_BUS_POLICY, name, policy.as_str());
            }
        }

        metakey.remove_group(GROUP_ENVIRONMENT);
        for (name, value) in &self.env_vars {
            metakey.set_string(GROUP_ENVIRONMENT, name, value);
        }

        let stale: Vec<String> = metakey
            .groups()
            .filter(|g| g.starts_with(GROUP_PREFIX_POLICY))
            .map(|g| g.to_string())
            .collect();
        for group in stale {
            metakey.remove_group(&group);
        }

        for (key, values) in &self.generic_policy {
            let kept: Vec<&String> = values
                .iter()
                .filter(|v| !flatten || !v.starts_with('!'))
                .collect();
            if kept.is_empty() {
                continue;
            }
            let Some((subsystem, subkey)) = key.split_once('.') else {
                continue;
            };
            let group = format!("{GROUP_PREFIX_POLICY}{subsystem}");
            metakey.set_string_list(&group, subkey, &kept);
        }
    }

    /// Serialize to a fresh metadata key-file.
    pub fn serialize(&self, flatten: bool) -> KeyFile {
        let mut metakey = KeyFile::new();
        self.save_metadata(flatten, &mut metakey);
        metakey
    }

    /// Emit the equivalent command-line argument list, so that any context
    /// can round-trip through the CLI surface.
    pub fn to_cli_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        self.shares.to_args(SHARE_NAMES, "--share", "--unshare", &mut args);
        self.sockets.to_args(SOCKET_NAMES, "--socket", "--nosocket", &mut args);
        self.devices.to_args(DEVICE_NAMES, "--device", "--nodevice", &mut args);
        self.features.to_args(FEATURE_NAMES, "--allow", "--disallow", &mut args);

        for (name, value) in &self.env_vars {
            args.push(format!("--env={name}={value}"));
        }
        for path in &self.persistent {
            args.push(format!("--persist={path}"));
        }
        for (name, policy) in &self.session_bus_policy {
            args.push(format!("--{}-name={name}", policy.as_str()));
        }
        for (name, policy) in &self.system_bus_policy {
            args.push(format!("--system-{}-name={name}", policy.as_str()));
        }
        for (fs, mode) in &self.filesystems {
            match mode {
                Some(FilesystemMode::ReadOnly) => args.push(format!("--filesystem={fs}:ro")),
                Some(FilesystemMode::ReadWrite) => args.push(format!("--filesystem={fs}")),
                Some(FilesystemMode::Create) => args.push(format!("--filesystem={fs}:create")),
                None => args.push(format!("--nofilesystem={fs}")),
            }
        }
        for (key, values) in &self.generic_policy {
            for value in values {
                match value.strip_prefix('!') {
                    Some(bare) => args.push(format!("--remove-policy={key}={bare}")),
                    None => args.push(format!("--add-policy={key}={value}")),
                }
            }
        }

        args
    }

    /// Apply one CLI-surface argument of the form emitted by to_cli_args.
    pub fn apply_cli_arg(&mut self, arg: &str) -> Result<(), ContextError> {
        let (flag, value) = arg
            .split_once('=')
            .ok_or_else(|| ContextError::BadPolicyArg(arg.to_string()))?;
        match flag {
            "--share" => self.share(value),
            "--unshare" => self.unshare(value),
            "--socket" => self.socket(value),
            "--nosocket" => self.nosocket(value),
            "--device" => self.device(value),
            "--nodevice" => self.nodevice(value),
            "--allow" => self.allow(value),
            "--disallow" => self.disallow(value),
            "--filesystem" => self.filesystem(value),
            "--nofilesystem" => self.nofilesystem(value),
            "--env" => self.env(value),
            "--persist" => {
                self.persist(value);
                Ok(())
            }
            "--own-name" => self.own_name(value),
            "--talk-name" => self.talk_name(value),
            "--see-name" | "--none-name" => {
                verify_dbus_name(value)?;
                let policy = if flag == "--see-name" { BusPolicy::See } else { BusPolicy::None };
                self.session_bus_policy.insert(value.to_string(), policy);
                Ok(())
            }
            "--system-own-name" => self.system_own_name(value),
            "--system-talk-name" => self.system_talk_name(value),
            "--system-see-name" | "--system-none-name" => {
                verify_dbus_name(value)?;
                let policy = if flag == "--system-see-name" { BusPolicy::See } else { BusPolicy::None };
                self.system_bus_policy.insert(value.to_string(), policy);
                Ok(())
            }
            "--add-policy" => self.add_policy(value),
            "--remove-policy" => self.remove_policy(value),
            _ => Err(ContextError::BadPolicyArg(arg.to_string())),
        }
    }

    pub fn needs_session_bus_proxy(&self) -> bool {
        !self.session_bus_policy.is_empty()
    }

    pub fn needs_system_bus_proxy(&self) -> bool {
        !self.system_bus_policy.is_empty()
    }

    pub fn allow_host_fs(&mut self) {
        self.filesystems
            .insert("host".to_string(), Some(FilesystemMode::ReadWrite));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(text: &str) -> KeyFile {
        KeyFile::parse(text).unwrap()
    }

    #[test]
    fn test_capset_tristate() {
        let mut caps = CapSet::default();
        caps.add(SHARE_NETWORK);
        caps.remove(SHARE_IPC);
        assert!(caps.has(SHARE_NETWORK));
        assert!(!caps.has(SHARE_IPC));
        // ipc is denied, not unspecified
        assert_ne!(caps.valid & SHARE_IPC, 0);
    }

    #[test]
    fn test_merge_deny_then_grant() {
        // A lower layer denies, a higher layer grants: grant wins.
        let mut base = Context::new();
        base.unshare("network").unwrap();

        let mut overlay = Context::new();
        overlay.share("network").unwrap();

        base.merge(&overlay);
        assert!(base.shares.has(SHARE_NETWORK));
    }

    #[test]
    fn test_merge_silence_preserves_deny() {
        let mut base = Context::new();
        base.unshare("network").unwrap();

        let overlay = Context::new();
        base.merge(&overlay);

        assert!(!base.shares.has(SHARE_NETWORK));
        assert_ne!(base.shares.valid & SHARE_NETWORK, 0);
    }

    #[test]
    fn test_merge_idempotence() {
        let mut a = Context::new();
        a.share("network").unwrap();
        a.socket("x11").unwrap();
        a.nosocket("pulseaudio").unwrap();
        a.filesystem("~/Music:ro").unwrap();
        a.talk_name("org.example.Svc").unwrap();
        a.add_policy("autostart.background=org.example.App").unwrap();

        let mut merged = a.clone();
        merged.merge(&a);
        assert_eq!(merged, a);

        let mut with_empty = a.clone();
        with_empty.merge(&Context::new());
        assert_eq!(with_empty, a);
    }

    #[test]
    fn test_metadata_roundtrip() {
        let mut a = Context::new();
        a.share("ipc").unwrap();
        a.unshare("network").unwrap();
        a.socket("wayland").unwrap();
        a.nosocket("x11").unwrap();
        a.device("dri").unwrap();
        a.allow("devel").unwrap();
        a.filesystem("host:ro").unwrap();
        a.filesystem("~/Downloads:create").unwrap();
        a.nofilesystem("~/Private").unwrap();
        a.persist(".mozilla");
        a.env("FOO=bar").unwrap();
        a.env("EMPTY=").unwrap();
        a.own_name("org.example.Own").unwrap();
        a.system_talk_name("org.example.SystemSvc").unwrap();
        a.add_policy("autostart.background=yes").unwrap();
        a.remove_policy("autostart.foreground=no").unwrap();

        let serialized = a.serialize(false);
        let b = Context::parse(&serialized).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_flatten_soundness() {
        let mut a = Context::new();
        a.share("network").unwrap();
        a.unshare("ipc").unwrap();
        a.nosocket("x11").unwrap();
        a.nofilesystem("~/Private").unwrap();
        a.add_policy("sub.key=keep").unwrap();
        a.remove_policy("sub.key=gone").unwrap();

        let flat = a.serialize(true);
        let text = flat.to_string();
        assert!(!text.contains('!'));

        let reparsed = Context::parse(&flat).unwrap();
        let mut from_empty = Context::new();
        from_empty.merge(&reparsed);

        // Grants are identical, no extra denials appear.
        assert!(from_empty.shares.has(SHARE_NETWORK));
        assert!(!from_empty.shares.has(SHARE_IPC));
        assert_eq!(from_empty.shares.valid & SHARE_IPC, 0);
        assert_eq!(from_empty.sockets.valid & SOCKET_X11, 0);
        assert_eq!(
            from_empty.generic_policy.get("sub.key"),
            Some(&vec!["keep".to_string()])
        );
    }

    #[test]
    fn test_cli_args_roundtrip() {
        let mut a = Context::new();
        a.share("network").unwrap();
        a.unshare("ipc").unwrap();
        a.socket("x11").unwrap();
        a.nodevice("kvm").unwrap();
        a.filesystem("xdg-download/incoming:create").unwrap();
        a.nofilesystem("home").unwrap();
        a.env("DEBUG=1").unwrap();
        a.persist(".config/app");
        a.own_name("org.example.A").unwrap();
        a.system_talk_name("org.example.B").unwrap();
        a.add_policy("autostart.background=x").unwrap();
        a.remove_policy("autostart.background=y").unwrap();

        let mut b = Context::new();
        for arg in a.to_cli_args() {
            b.apply_cli_arg(&arg).unwrap();
        }
        assert_eq!(a, b);
    }

    #[test]
    fn test_policy_merge_last_writer_wins() {
        // Metadata grants talk, overrides upgrade to own: exactly one
        // entry mapping the name to Own remains.
        let mut base = Context::parse(&metadata(
            "[Session Bus Policy]\norg.example.A=talk\n",
        ))
        .unwrap();
        let overrides = Context::parse(&metadata(
            "[Session Bus Policy]\norg.example.A=own\n",
        ))
        .unwrap();

        base.merge(&overrides);
        assert_eq!(base.session_bus_policy.len(), 1);
        assert_eq!(base.session_bus_policy["org.example.A"], BusPolicy::Own);

        let args = base.to_cli_args();
        assert_eq!(args, vec!["--own-name=org.example.A".to_string()]);
    }

    #[test]
    fn test_generic_policy_apply_sequence() {
        let mut context = Context::new();
        context.apply_generic_policy("sub.key", "foo");
        context.apply_generic_policy("sub.key", "!foo");
        context.apply_generic_policy("sub.key", "foo");
        assert_eq!(
            context.generic_policy.get("sub.key"),
            Some(&vec!["foo".to_string()])
        );
    }

    #[test]
    fn test_generic_policy_removal_survives_merge() {
        let mut base = Context::new();
        base.apply_generic_policy("sub.key", "value");

        let mut overlay = Context::new();
        overlay.apply_generic_policy("sub.key", "!value");

        base.merge(&overlay);
        assert_eq!(
            base.generic_policy.get("sub.key"),
            Some(&vec!["!value".to_string()])
        );
    }

    #[test]
    fn test_unknown_names_are_rejected() {
        let mut context = Context::new();
        let err = context.share("bluetooth").unwrap_err();
        match err {
            ContextError::UnknownName { kind, value, valid_values } => {
                assert_eq!(kind, "share");
                assert_eq!(value, "bluetooth");
                assert_eq!(valid_values, "network, ipc");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(context.socket("telepathy").is_err());
        assert!(context.device("midi").is_err());
        assert!(context.allow("timetravel").is_err());
    }

    #[test]
    fn test_bus_name_validation() {
        assert!(verify_dbus_name("org.example.App").is_ok());
        assert!(verify_dbus_name("org.example.App.*").is_ok());
        assert!(verify_dbus_name("org.freedesktop.portal.Desktop").is_ok());

        // Unique connection names are rejected
        assert!(verify_dbus_name(":1.42").is_err());
        // Single element
        assert!(verify_dbus_name("nodots").is_err());
        // Empty element
        assert!(verify_dbus_name("org..App").is_err());
        // Element starting with a digit
        assert!(verify_dbus_name("org.1example.App").is_err());
        // Bare wildcard
        assert!(verify_dbus_name(".*").is_err());
    }

    #[test]
    fn test_filesystem_spec_validation() {
        let mut context = Context::new();
        assert!(context.filesystem("host").is_ok());
        assert!(context.filesystem("home:ro").is_ok());
        assert!(context.filesystem("xdg-download").is_ok());
        assert!(context.filesystem("xdg-run/keyring").is_ok());
        assert!(context.filesystem("~/Music").is_ok());
        assert!(context.filesystem("/mnt/data:rw").is_ok());

        assert!(context.filesystem("relative/path").is_err());
        assert!(context.filesystem("xdg-nonsense").is_err());
        // xdg-run without a subpath is not usable
        assert!(context.filesystem("xdg-run").is_err());
    }

    #[test]
    fn test_policy_value_must_not_be_negated() {
        let mut context = Context::new();
        assert!(matches!(
            context.add_policy("sub.key=!value"),
            Err(ContextError::NegatedPolicyValue(_))
        ));
        assert!(context.add_policy("nodot=value").is_err());
    }

    #[test]
    fn test_default_permissions() {
        let context = Context::with_default_permissions();
        assert_eq!(
            context.session_bus_policy.get("org.freedesktop.portal.*"),
            Some(&BusPolicy::Talk)
        );
    }

    #[test]
    fn test_load_metadata_negation_items() {
        let context = Context::parse(&metadata(
            "[Context]\nshared=network;!ipc;\nsockets=!x11;wayland;\n",
        ))
        .unwrap();
        assert!(context.shares.has(SHARE_NETWORK));
        assert!(!context.shares.has(SHARE_IPC));
        assert_ne!(context.shares.valid & SHARE_IPC, 0);
        assert!(context.sockets.has(SOCKET_WAYLAND));
        assert!(!context.sockets.has(SOCKET_X11));
    }

    #[test]
    fn test_filtered_policy_parses_and_flattens_to_none() {
        let context = Context::parse(&metadata(
            "[Session Bus Policy]\norg.example.F=filtered\n",
        ))
        .unwrap();
        assert_eq!(context.session_bus_policy["org.example.F"], BusPolicy::Filtered);

        let out = context.serialize(false);
        assert_eq!(
            out.get_string(GROUP_SESSION_BUS_POLICY, "org.example.F").as_deref(),
            Some("none")
        );
    }
}
