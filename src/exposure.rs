/// Filesystem exposure planner: reconciles the context's filesystem grants
/// into a minimal, consistent set of bind/dir/tmpfs/symlink operations for
/// the executor.
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt};
use std::path::{Component, Path, PathBuf};

use crate::argstream::ArgStream;
use crate::context::{split_xdg_prefix, Context, FilesystemMode};

/// Paths we never export into: they are synthesized from the runtime and
/// app images and do not match the host anyway.
const RESERVED_PREFIXES: &[&str] = &[
    "/lib", "/lib32", "/lib64", "/bin", "/sbin", "/usr", "/etc", "/app", "/dev",
];

/// Top-level host entries skipped when exposing the whole host filesystem.
const ROOT_BLACKLIST: &[&str] = &[
    "lib", "lib32", "lib64", "bin", "sbin", "usr", "boot", "root", "tmp", "etc", "app", "run",
    "proc", "sys", "dev", "var",
];

/// Symlink recursion cap, matching the kernel ELOOP limit.
const MAX_SYMLINK_DEPTH: u32 = 40;

/// How one path appears inside the sandbox. Ordering is by increasing
/// privilege: when two rules target the same path the larger wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Exposure {
    /// Ensure a directory exists, either on a parent tmpfs or mapped parent.
    Dir,
    /// Hide whatever the host has here.
    Tmpfs,
    BindRo,
    BindRw,
    /// Same bind as rw; additionally allocated before exposure.
    BindCreate,
    /// Recreate a host symlink; the target was exposed separately.
    Symlink,
}

impl From<FilesystemMode> for Exposure {
    fn from(mode: FilesystemMode) -> Self {
        match mode {
            FilesystemMode::ReadOnly => Exposure::BindRo,
            FilesystemMode::ReadWrite => Exposure::BindRw,
            FilesystemMode::Create => Exposure::BindCreate,
        }
    }
}

/// Lexical canonicalization: collapse `.`, `..` and repeated separators
/// without touching the filesystem. Symlinks are handled explicitly by the
/// planner, so resolving them here would be wrong.
pub fn canonicalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for comp in path.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(c) => out.push(c),
        }
    }
    out
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

fn is_dir_no_follow(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_dir())
        .unwrap_or(false)
}

/// Resolve one symlink level to an absolute, lexically canonical target.
fn resolve_link(path: &Path) -> Option<PathBuf> {
    let target = fs::read_link(path).ok()?;
    let absolute = if target.is_absolute() {
        target
    } else {
        path.parent()?.join(target)
    };
    Some(canonicalize_lexical(&absolute))
}

/// Relative path from `base` (a directory) to `path`, so recreated symlinks
/// resolve inside the sandbox regardless of where the root is mounted.
fn make_relative(base: &Path, path: &Path) -> OsString {
    let mut out = OsString::new();
    for comp in base.components() {
        if matches!(comp, Component::Normal(_)) {
            out.push("../");
        }
    }
    let stripped = path.strip_prefix("/").unwrap_or(path);
    out.push(stripped.as_os_str());
    out
}

/// Resolved view of an `xdg-*` filesystem spec.
pub struct XdgDir {
    /// The user-dirs.dirs key, for the configurable user dirs only.
    pub config_key: Option<&'static str>,
    /// Resolved root; None when the dir is not configured on this host.
    pub root: Option<PathBuf>,
    pub subpath: String,
}

/// Resolve an `xdg-<name>[/sub]` spec against the host session.
pub fn resolve_xdg_dir(filesystem: &str) -> Option<XdgDir> {
    let (prefix, rest) = split_xdg_prefix(filesystem)?;
    let (config_key, root) = match prefix {
        "xdg-desktop" => (Some("XDG_DESKTOP_DIR"), dirs::desktop_dir()),
        "xdg-documents" => (Some("XDG_DOCUMENTS_DIR"), dirs::document_dir()),
        "xdg-download" => (Some("XDG_DOWNLOAD_DIR"), dirs::download_dir()),
        "xdg-music" => (Some("XDG_MUSIC_DIR"), dirs::audio_dir()),
        "xdg-pictures" => (Some("XDG_PICTURES_DIR"), dirs::picture_dir()),
        "xdg-public-share" => (Some("XDG_PUBLICSHARE_DIR"), dirs::public_dir()),
        "xdg-templates" => (Some("XDG_TEMPLATES_DIR"), dirs::template_dir()),
        "xdg-videos" => (Some("XDG_VIDEOS_DIR"), dirs::video_dir()),
        "xdg-data" => (None, dirs::data_dir()),
        "xdg-cache" => (None, dirs::cache_dir()),
        "xdg-config" => (None, dirs::config_dir()),
        "xdg-run" => (None, dirs::runtime_dir()),
        _ => return None,
    };
    Some(XdgDir {
        config_key,
        root,
        subpath: rest.to_string(),
    })
}

/// Resolve `xdg-{data,config,cache}[/sub]` specs only, with the name of the
/// matching per-app storage subdirectory. Used for the per-app opt-out
/// binds.
pub fn resolve_xdg_storage_dir(filesystem: &str) -> Option<(&'static str, PathBuf, String)> {
    let (prefix, rest) = split_xdg_prefix(filesystem)?;
    let (where_, root) = match prefix {
        "xdg-data" => ("data", dirs::data_dir()?),
        "xdg-cache" => ("cache", dirs::cache_dir()?),
        "xdg-config" => ("config", dirs::config_dir()?),
        _ => return None,
    };
    Some((where_, root, rest.to_string()))
}

#[derive(Debug, Clone, Default)]
pub struct ExposurePlan {
    entries: BTreeMap<PathBuf, Exposure>,
}

/// Inputs that vary per launch (and per test).
pub struct PlanOptions<'a> {
    pub app_id_dir: Option<&'a Path>,
    pub user_install_dir: Option<&'a Path>,
    pub home_dir: &'a Path,
    /// Whether Create-mode paths get allocated while planning.
    pub create_dirs: bool,
}

pub struct PlanOutcome {
    pub plan: ExposurePlan,
    pub home_access: bool,
    /// (user-dirs.dirs key, xdg root) pairs for granted configurable dirs.
    pub xdg_dirs: Vec<(String, PathBuf)>,
}

impl ExposurePlan {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, path: PathBuf, mode: Exposure) {
        let entry = self.entries.entry(path).or_insert(mode);
        if mode > *entry {
            *entry = mode;
        }
    }

    pub fn expose(&mut self, mode: FilesystemMode, path: &Path) -> bool {
        self.expose_at_level(Exposure::from(mode), path, 0)
    }

    pub fn expose_tmpfs(&mut self, path: &Path) -> bool {
        self.expose_at_level(Exposure::Tmpfs, path, 0)
    }

    pub fn expose_dir(&mut self, path: &Path) -> bool {
        self.expose_at_level(Exposure::Dir, path, 0)
    }

    fn expose_at_level(&mut self, mode: Exposure, path: &Path, level: u32) -> bool {
        if level > MAX_SYMLINK_DEPTH {
            log::debug!("Expose too deep, bailing at {}", path.display());
            return false;
        }

        if !path.is_absolute() {
            log::debug!("Not exposing relative path {}", path.display());
            return false;
        }

        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(_) => return false,
        };
        let ft = meta.file_type();
        if !(ft.is_dir() || ft.is_file() || ft.is_symlink() || ft.is_socket()) {
            return false;
        }

        let canonical = canonicalize_lexical(path);

        for reserved in RESERVED_PREFIXES {
            if canonical.starts_with(reserved) {
                log::debug!("skipping export for path {}", canonical.display());
                return false;
            }
        }

        /* Handle symlinks in any prefix, including the path itself: the
         * symlink is recreated in the sandbox and the resolved target is
         * exposed instead. /tmp stays a concrete directory always. */
        let comps: Vec<_> = canonical
            .components()
            .filter_map(|c| match c {
                Component::Normal(n) => Some(n.to_os_string()),
                _ => None,
            })
            .collect();
        let mut prefix = PathBuf::from("/");
        for (i, comp) in comps.iter().enumerate() {
            prefix.push(comp);
            if is_symlink(&prefix) && prefix != Path::new("/tmp") {
                if let Some(resolved) = resolve_link(&prefix) {
                    let mut new_target = resolved;
                    for rest in &comps[i + 1..] {
                        new_target.push(rest);
                    }
                    if self.expose_at_level(mode, &new_target, level + 1) {
                        self.record(prefix, Exposure::Symlink);
                        return true;
                    }
                }
                return false;
            }
        }

        self.record(canonical, mode);
        true
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Path, Exposure)> {
        self.entries.iter().map(|(p, m)| (p.as_path(), *m))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether some proper-prefix entry already maps `path` into the
    /// sandbox. Dir entries inherit the parent's answer; tmpfs unmaps.
    fn parent_is_mapped(&self, path: &Path) -> bool {
        let mut mapped = false;
        for (entry_path, mode) in &self.entries {
            if path.starts_with(entry_path) && path != entry_path.as_path() {
                if *mode == Exposure::Dir {
                    continue;
                }
                mapped = *mode != Exposure::Tmpfs;
            }
        }
        mapped
    }

    fn path_is_mapped(&self, path: &Path) -> bool {
        let mut mapped = false;
        for (entry_path, mode) in &self.entries {
            if path.starts_with(entry_path) {
                match *mode {
                    Exposure::Dir => continue,
                    Exposure::Symlink => mapped = path == entry_path.as_path(),
                    Exposure::Tmpfs => mapped = false,
                    _ => mapped = true,
                }
            }
        }
        mapped
    }

    /// Emit the plan. The BTreeMap iterates parents before children, which
    /// is what guarantees parent mounts are set up first.
    pub fn emit_args(&self, stream: &mut ArgStream) {
        for (path, mode) in &self.entries {
            match mode {
                Exposure::Symlink => {
                    if !self.parent_is_mapped(path) {
                        if let (Some(resolved), Some(parent)) = (resolve_link(path), path.parent())
                        {
                            let relative = make_relative(parent, &resolved);
                            stream.arg("--symlink").arg(relative).arg(path);
                        }
                    }
                }
                Exposure::Tmpfs => {
                    /* Only hide places where a pre-existing dir gives us a
                     * mount point. */
                    if is_dir_no_follow(path) {
                        if !self.parent_is_mapped(path) {
                            // Parent is already a tmpfs, a dir is enough
                            stream.arg("--dir").arg(path);
                        } else {
                            stream.arg("--tmpfs").arg(path);
                        }
                    }
                }
                Exposure::Dir => {
                    if is_dir_no_follow(path) {
                        stream.arg("--dir").arg(path);
                    }
                }
                Exposure::BindRo => {
                    stream.arg("--ro-bind").arg(path).arg(path);
                }
                Exposure::BindRw | Exposure::BindCreate => {
                    stream.arg("--bind").arg(path).arg(path);
                }
            }
        }
    }

    /// Whether `path` resolves to a mapped entry inside the sandbox. A path
    /// is visible if no mapped parent element is a symlink and the final
    /// element is mapped; mapped symlinks are resolved and the walk
    /// restarts on the target.
    pub fn is_visible(&self, path: &Path) -> bool {
        self.is_visible_at_level(path, 0)
    }

    fn is_visible_at_level(&self, path: &Path, level: u32) -> bool {
        if level > MAX_SYMLINK_DEPTH {
            return false;
        }

        let canonical = canonicalize_lexical(path);
        let comps: Vec<_> = canonical
            .components()
            .filter_map(|c| match c {
                Component::Normal(n) => Some(n.to_os_string()),
                _ => None,
            })
            .collect();

        let mut prefix = PathBuf::from("/");
        for (i, comp) in comps.iter().enumerate() {
            prefix.push(comp);

            if self.path_is_mapped(&prefix) {
                let meta = match fs::symlink_metadata(&prefix) {
                    Ok(meta) => meta,
                    Err(_) => return false,
                };
                if meta.file_type().is_symlink() {
                    let resolved = match resolve_link(&prefix) {
                        Some(resolved) => resolved,
                        None => return false,
                    };
                    let mut rest = resolved;
                    for c in &comps[i + 1..] {
                        rest.push(c);
                    }
                    return self.is_visible_at_level(&rest, level + 1);
                }
            } else if i + 1 == comps.len() {
                return false; // Last element is not mapped
            }
        }

        true
    }
}

/// Build the plan for a final context.
pub fn plan_from_context(context: &Context, opts: &PlanOptions<'_>) -> PlanOutcome {
    let mut plan = ExposurePlan::new();
    let mut home_access = false;
    let mut xdg_dirs: Vec<(String, PathBuf)> = Vec::new();

    let host_mode = context.filesystems.get("host").copied().flatten();
    if let Some(mode) = host_mode {
        log::debug!("Allowing host-fs access");
        home_access = true;

        if let Ok(dir) = fs::read_dir("/") {
            for entry in dir.flatten() {
                let name = entry.file_name();
                if ROOT_BLACKLIST.iter().any(|b| name.as_os_str() == *b) {
                    continue;
                }
                plan.expose(mode, &Path::new("/").join(name));
            }
        }
        plan.expose(mode, Path::new("/run/media"));
    }

    let home_mode = context.filesystems.get("home").copied().flatten();
    if let Some(mode) = home_mode {
        log::debug!("Allowing homedir access");
        home_access = true;
        let effective = match host_mode {
            Some(host) => mode.max(host),
            None => mode,
        };
        plan.expose(effective, opts.home_dir);
    }

    for (filesystem, mode) in &context.filesystems {
        let mode = match mode {
            Some(mode) => *mode,
            None => continue, // negated
        };
        if filesystem == "host" || filesystem == "home" {
            continue;
        }

        if filesystem.starts_with("xdg-") {
            let xdg = match resolve_xdg_dir(filesystem) {
                Some(xdg) => xdg,
                None => {
                    log::warn!("Unsupported xdg dir {filesystem}");
                    continue;
                }
            };
            let root = match xdg.root {
                Some(root) => root,
                None => continue, // Unconfigured on this host
            };
            if root == opts.home_dir {
                /* Disabled user dirs fall back to $HOME; exposing all of
                 * $HOME has to stay an explicit decision. */
                log::debug!("Xdg dir {filesystem} is $HOME (i.e. disabled), ignoring");
                continue;
            }
            let subpath = if xdg.subpath.is_empty() {
                root.clone()
            } else {
                root.join(&xdg.subpath)
            };
            if mode == FilesystemMode::Create && opts.create_dirs {
                let _ = fs::DirBuilder::new().recursive(true).mode(0o755).create(&subpath);
            }
            if subpath.exists() {
                if let Some(key) = xdg.config_key {
                    xdg_dirs.push((key.to_string(), root));
                }
                plan.expose(mode, &subpath);
            }
        } else if let Some(rest) = filesystem.strip_prefix("~/") {
            let path = opts.home_dir.join(rest);
            if mode == FilesystemMode::Create && opts.create_dirs {
                let _ = fs::DirBuilder::new().recursive(true).mode(0o755).create(&path);
            }
            if path.exists() {
                plan.expose(mode, &path);
            }
        } else if filesystem.starts_with('/') {
            let path = Path::new(filesystem);
            if mode == FilesystemMode::Create && opts.create_dirs {
                let _ = fs::DirBuilder::new().recursive(true).mode(0o755).create(path);
            }
            if path.exists() {
                plan.expose(mode, path);
            }
        } else {
            log::warn!("Unexpected filesystem arg {filesystem}");
        }
    }

    if let Some(app_id_dir) = opts.app_id_dir {
        // Hide the per-app data area by default, then re-expose our own dir
        if let Some(parent) = app_id_dir.parent() {
            plan.expose_tmpfs(parent);
        }
        plan.expose(FilesystemMode::ReadWrite, app_id_dir);
    }

    if let Some(install_dir) = opts.user_install_dir {
        // The user install root never leaks in by default
        plan.expose_tmpfs(install_dir);
    }

    // There is always a concrete home directory, exposed or not
    plan.expose_dir(opts.home_dir);

    PlanOutcome {
        plan,
        home_access,
        xdg_dirs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn plan_opts<'a>(home: &'a Path) -> PlanOptions<'a> {
        PlanOptions {
            app_id_dir: None,
            user_install_dir: None,
            home_dir: home,
            create_dirs: false,
        }
    }

    #[test]
    fn test_parents_emitted_before_children() {
        let tmp = tempfile::tempdir().unwrap();
        let parent = tmp.path().join("data");
        let child = parent.join("nested/dir");
        fs::create_dir_all(&child).unwrap();

        let mut plan = ExposurePlan::new();
        plan.expose(FilesystemMode::ReadWrite, &child);
        plan.expose(FilesystemMode::ReadOnly, &parent);

        let mut stream = ArgStream::new();
        plan.emit_args(&mut stream);
        let args = stream.args_lossy();
        let parent_pos = args.iter().position(|a| *a == parent.to_string_lossy()).unwrap();
        let child_pos = args.iter().position(|a| *a == child.to_string_lossy()).unwrap();
        assert!(parent_pos < child_pos);
    }

    #[test]
    fn test_stronger_mode_wins_on_same_path() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("shared");
        fs::create_dir(&dir).unwrap();

        let mut plan = ExposurePlan::new();
        plan.expose(FilesystemMode::ReadOnly, &dir);
        plan.expose(FilesystemMode::ReadWrite, &dir);
        plan.expose(FilesystemMode::ReadOnly, &dir);

        let mut stream = ArgStream::new();
        plan.emit_args(&mut stream);
        let args = stream.args_lossy();
        assert!(args.contains(&"--bind".to_string()));
        assert!(!args.contains(&"--ro-bind".to_string()));
    }

    #[test]
    fn test_reserved_prefixes_are_rejected() {
        let mut plan = ExposurePlan::new();
        assert!(!plan.expose(FilesystemMode::ReadOnly, Path::new("/etc/passwd")));
        assert!(!plan.expose(FilesystemMode::ReadWrite, Path::new("relative/path")));
        assert!(plan.is_empty());
    }

    #[test]
    fn test_symlink_prefix_becomes_symlink_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("target");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("file"), b"x").unwrap();
        let link = tmp.path().join("link");
        symlink("target", &link).unwrap();

        let mut plan = ExposurePlan::new();
        assert!(plan.expose(FilesystemMode::ReadOnly, &link.join("file")));

        let entries: BTreeMap<_, _> = plan.entries().map(|(p, m)| (p.to_path_buf(), m)).collect();
        assert_eq!(entries.get(&link), Some(&Exposure::Symlink));
        assert_eq!(entries.get(&target.join("file")), Some(&Exposure::BindRo));

        let mut stream = ArgStream::new();
        plan.emit_args(&mut stream);
        let args = stream.args_lossy();
        let idx = args.iter().position(|a| a == "--symlink").unwrap();
        // Relative target: up out of the tempdir parent, back down to target
        assert!(args[idx + 1].ends_with("/target"));
        assert!(args[idx + 1].starts_with("../"));
        assert_eq!(args[idx + 2], link.to_string_lossy());
    }

    #[test]
    fn test_symlink_loop_terminates() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        symlink(&b, &a).unwrap();
        symlink(&a, &b).unwrap();

        let mut plan = ExposurePlan::new();
        assert!(!plan.expose(FilesystemMode::ReadOnly, &a.join("deep")));
    }

    #[test]
    fn test_tmpfs_with_unmapped_parent_renders_as_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let hidden = tmp.path().join("apps");
        let visible = hidden.join("this-app");
        fs::create_dir_all(&visible).unwrap();

        let mut plan = ExposurePlan::new();
        plan.expose_tmpfs(&hidden);
        plan.expose(FilesystemMode::ReadWrite, &visible);

        let mut stream = ArgStream::new();
        plan.emit_args(&mut stream);
        let args = stream.args_lossy();
        // No bind covers the parent, so it renders as --dir
        let idx = args.iter().position(|a| *a == hidden.to_string_lossy()).unwrap();
        assert_eq!(args[idx - 1], "--dir");
    }

    #[test]
    fn test_tmpfs_with_mapped_parent_stays_tmpfs() {
        let tmp = tempfile::tempdir().unwrap();
        let outer = tmp.path().join("outer");
        let inner = outer.join("inner");
        fs::create_dir_all(&inner).unwrap();

        let mut plan = ExposurePlan::new();
        plan.expose(FilesystemMode::ReadWrite, &outer);
        plan.expose_tmpfs(&inner);

        let mut stream = ArgStream::new();
        plan.emit_args(&mut stream);
        let args = stream.args_lossy();
        let idx = args.iter().position(|a| *a == inner.to_string_lossy()).unwrap();
        assert_eq!(args[idx - 1], "--tmpfs");
    }

    #[test]
    fn test_visibility_query() {
        let tmp = tempfile::tempdir().unwrap();
        let exposed = tmp.path().join("exposed");
        let hidden = tmp.path().join("hidden");
        fs::create_dir_all(exposed.join("sub")).unwrap();
        fs::create_dir_all(&hidden).unwrap();
        fs::write(exposed.join("sub/file"), b"x").unwrap();

        let mut plan = ExposurePlan::new();
        plan.expose(FilesystemMode::ReadOnly, &exposed);

        assert!(plan.is_visible(&exposed));
        assert!(plan.is_visible(&exposed.join("sub/file")));
        assert!(!plan.is_visible(&hidden));
        assert!(!plan.is_visible(Path::new("/nonexistent/nowhere")));
    }

    #[test]
    fn test_visibility_under_tmpfs_is_false() {
        let tmp = tempfile::tempdir().unwrap();
        let area = tmp.path().join("area");
        fs::create_dir_all(area.join("sub")).unwrap();

        let mut plan = ExposurePlan::new();
        plan.expose(FilesystemMode::ReadWrite, tmp.path());
        plan.expose_tmpfs(&area);

        assert!(plan.is_visible(tmp.path()));
        assert!(!plan.is_visible(&area.join("sub")));
    }

    #[test]
    fn test_plan_monotonicity() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().join("home");
        let extra = tmp.path().join("extra");
        fs::create_dir_all(&home).unwrap();
        fs::create_dir_all(&extra).unwrap();

        let granted = home.join("x");
        let mut context = Context::new();
        context.filesystem(granted.to_str().unwrap()).unwrap();
        fs::create_dir_all(&granted).unwrap();

        let base = plan_from_context(&context, &plan_opts(&home));
        let base_paths: Vec<PathBuf> =
            base.plan.entries().map(|(p, _)| p.to_path_buf()).collect();

        context.filesystem(extra.to_str().unwrap()).unwrap();
        let extended = plan_from_context(&context, &plan_opts(&home));
        let extended_paths: Vec<PathBuf> =
            extended.plan.entries().map(|(p, _)| p.to_path_buf()).collect();

        for path in &base_paths {
            assert!(extended_paths.contains(path), "{path:?} dropped from plan");
        }
    }

    #[test]
    fn test_nofilesystem_makes_path_invisible() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().join("home");
        let private = home.join("Private");
        fs::create_dir_all(&private).unwrap();

        let mut granted = Context::new();
        granted.filesystem(private.to_str().unwrap()).unwrap();
        let outcome = plan_from_context(&granted, &plan_opts(&home));
        assert!(outcome.plan.is_visible(&private));

        granted.nofilesystem(private.to_str().unwrap()).unwrap();
        let outcome = plan_from_context(&granted, &plan_opts(&home));
        assert!(!outcome.plan.is_visible(&private));
    }

    #[test]
    fn test_home_access_flags_and_hiding() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().join("home");
        let app_dir = home.join(".var/app/org.example.App");
        let install = home.join(".local/share/appbox");
        fs::create_dir_all(&app_dir).unwrap();
        fs::create_dir_all(&install).unwrap();

        let mut context = Context::new();
        context.filesystem("home").unwrap();

        let outcome = plan_from_context(
            &context,
            &PlanOptions {
                app_id_dir: Some(&app_dir),
                user_install_dir: Some(&install),
                home_dir: &home,
                create_dirs: false,
            },
        );
        assert!(outcome.home_access);

        let entries: BTreeMap<_, _> = outcome
            .plan
            .entries()
            .map(|(p, m)| (p.to_path_buf(), m))
            .collect();
        assert_eq!(entries.get(&home.join(".var/app")), Some(&Exposure::Tmpfs));
        assert_eq!(entries.get(&app_dir), Some(&Exposure::BindRw));
        assert_eq!(entries.get(&install), Some(&Exposure::Tmpfs));
    }

    #[test]
    fn test_create_mode_allocates_path() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().join("home");
        fs::create_dir_all(&home).unwrap();
        let wanted = home.join("NewDir");

        let mut context = Context::new();
        context
            .filesystem(&format!("{}:create", wanted.display()))
            .unwrap();

        let outcome = plan_from_context(
            &context,
            &PlanOptions {
                app_id_dir: None,
                user_install_dir: None,
                home_dir: &home,
                create_dirs: true,
            },
        );
        assert!(wanted.is_dir());
        assert!(outcome.plan.is_visible(&wanted));
    }

    #[test]
    fn test_canonicalize_lexical() {
        assert_eq!(
            canonicalize_lexical(Path::new("/a//b/./c/../d")),
            PathBuf::from("/a/b/d")
        );
        assert_eq!(canonicalize_lexical(Path::new("/../x")), PathBuf::from("/x"));
    }

    #[test]
    fn test_make_relative() {
        assert_eq!(make_relative(Path::new("/a"), Path::new("/x")), OsString::from("../x"));
        assert_eq!(
            make_relative(Path::new("/a/b"), Path::new("/x/y")),
            OsString::from("../../x/y")
        );
    }
}
