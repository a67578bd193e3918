/// Locating installed runtime/app extensions and mounting them into the
/// sandbox in priority order.
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use crate::argstream::ArgStream;
use crate::deploy::{DeployStore, Ref, RefKind};
use crate::keyfile::KeyFile;
use crate::types::Result;

const EXTENSION_GROUP_PREFIX: &str = "Extension ";

/// One resolved extension: an installed add-on directory merged into the
/// runtime (or app) tree.
#[derive(Debug, Clone)]
pub struct Extension {
    /// Extension point id from the metadata group.
    pub id: String,
    /// Installed ref id, including any subdirectory tail.
    pub installed_id: String,
    pub commit: Option<String>,
    pub files_path: PathBuf,
    /// Mount directory relative to /usr (or /app).
    pub directory: String,
    /// Tail appended below `directory` for subdirectory extensions.
    pub subdir_suffix: String,
    pub add_ld_path: Option<String>,
    pub merge_dirs: Vec<String>,
    /// The mount point does not exist in the read-only origin tree, so the
    /// executor needs a tmpfs on the parent to create it.
    pub needs_tmpfs: bool,
}

/// Resolve the `[Extension <id>]` groups of a metadata key-file against the
/// deploy store. The returned order is priority order: metadata order, with
/// subdirectory refs in id order within their extension point.
pub fn list_extensions(
    metakey: &KeyFile,
    arch: &str,
    branch: &str,
    store: &DeployStore,
    origin_files: &std::path::Path,
) -> Vec<Extension> {
    let mut extensions = Vec::new();

    let groups: Vec<String> = metakey
        .groups()
        .filter(|g| g.starts_with(EXTENSION_GROUP_PREFIX))
        .map(|g| g.to_string())
        .collect();

    for group in groups {
        let id = group[EXTENSION_GROUP_PREFIX.len()..].to_string();
        let directory = match metakey.get_string(&group, "directory") {
            Some(dir) if !dir.is_empty() => dir,
            _ => {
                log::warn!("Extension {id} has no directory, ignoring");
                continue;
            }
        };
        let version = metakey
            .get_string(&group, "version")
            .unwrap_or_else(|| branch.to_string());
        let add_ld_path = metakey.get_string(&group, "add-ld-path").filter(|s| !s.is_empty());
        let merge_dirs = metakey
            .get_string_list(&group, "merge-dirs")
            .unwrap_or_default();
        let subdirectories = metakey
            .get_boolean(&group, "subdirectories")
            .unwrap_or(false);

        let point_exists = origin_files.join(&directory).exists();

        if subdirectories {
            let prefix = format!("{id}.");
            for sub_ref in store.list_runtime_refs_with_prefix(&prefix, arch, &version) {
                let deploy = match store.lookup(&sub_ref) {
                    Ok(deploy) => deploy,
                    Err(e) => {
                        log::warn!("Skipping extension {}: {e}", sub_ref.id);
                        continue;
                    }
                };
                let tail = sub_ref.id[prefix.len()..].to_string();
                extensions.push(Extension {
                    id: id.clone(),
                    installed_id: sub_ref.id.clone(),
                    commit: Some(deploy.commit),
                    files_path: deploy.files,
                    directory: format!("{directory}/{tail}"),
                    subdir_suffix: String::new(),
                    add_ld_path: add_ld_path.clone(),
                    merge_dirs: merge_dirs.clone(),
                    needs_tmpfs: !point_exists,
                });
            }
        } else {
            let wanted = Ref::runtime(&id, arch, &version);
            if let Ok(deploy) = store.lookup(&wanted) {
                extensions.push(Extension {
                    id: id.clone(),
                    installed_id: id.clone(),
                    commit: Some(deploy.commit),
                    files_path: deploy.files,
                    directory,
                    subdir_suffix: String::new(),
                    add_ld_path,
                    merge_dirs,
                    needs_tmpfs: false,
                });
            }
        }
    }

    extensions
}

fn mount_prefix(for_ref: &Ref) -> &'static str {
    match for_ref.kind {
        RefKind::App => "/app",
        RefKind::Runtime => "/usr",
    }
}

/// Emit the bind, library-path and merge-dir arguments for `extensions`,
/// which belong to `for_ref` (the app or the runtime). Returns the
/// `id=commit[;id=commit…]` summary recorded in the instance info and the
/// ld-cache key.
pub fn add_extension_args(
    stream: &mut ArgStream,
    env: &mut BTreeMap<String, String>,
    extensions: &[Extension],
    for_ref: &Ref,
    use_ld_so_cache: bool,
) -> Result<String> {
    let is_app = for_ref.kind == RefKind::App;
    let prefix = mount_prefix(for_ref);
    let mut mounted_tmpfs: HashSet<String> = HashSet::new();
    let mut created_symlink: HashSet<String> = HashSet::new();
    let mut used_extensions = String::new();
    let mut ld_library_path = String::new();
    let mut count = 0;

    /* Bindings first, sorted alphabetically so parent directories are
     * mounted before child directories. */
    let mut path_sorted: Vec<&Extension> = extensions.iter().collect();
    path_sorted.sort_by(|a, b| a.directory.cmp(&b.directory));

    for ext in path_sorted {
        let directory = format!("{prefix}/{}", ext.directory);
        let full_directory = if ext.subdir_suffix.is_empty() {
            directory.clone()
        } else {
            format!("{directory}/{}", ext.subdir_suffix)
        };

        if ext.needs_tmpfs {
            let parent = parent_dir(&directory);
            if mounted_tmpfs.insert(parent.clone()) {
                stream.arg("--tmpfs").arg(&parent);
            }
        }

        stream.arg("--ro-bind").arg(&ext.files_path).arg(&full_directory);

        if ext.files_path.join(".ref").exists() {
            stream.arg("--lock-file").arg(format!("{full_directory}/.ref"));
        }
    }

    /* Then library dirs and file merging, in extension priority order */
    for ext in extensions {
        let directory = format!("{prefix}/{}", ext.directory);
        let full_directory = if ext.subdir_suffix.is_empty() {
            directory.clone()
        } else {
            format!("{directory}/{}", ext.subdir_suffix)
        };

        if !used_extensions.is_empty() {
            used_extensions.push(';');
        }
        used_extensions.push_str(&ext.installed_id);
        used_extensions.push('=');
        used_extensions.push_str(ext.commit.as_deref().unwrap_or("local"));

        if let Some(add_ld_path) = &ext.add_ld_path {
            let ld_path = format!("{full_directory}/{add_ld_path}");

            if use_ld_so_cache {
                /* The app/runtime prefix and a counter get the include
                 * order of the conf fragments right. */
                count += 1;
                let conf_name = format!(
                    "{}-{:03}-{}.conf",
                    for_ref.kind.as_str(),
                    count,
                    ext.installed_id
                );
                let conf_path = format!("/run/flatpak/ld.so.conf.d/{conf_name}");
                stream.add_data("ld-so-conf", format!("{ld_path}\n").as_bytes(), &conf_path)?;
            } else {
                if !ld_library_path.is_empty() {
                    ld_library_path.push(':');
                }
                ld_library_path.push_str(&ld_path);
            }
        }

        for merge_dir in &ext.merge_dirs {
            let parent = parent_dir(&directory);
            let merge_dir_path = format!("{parent}/{merge_dir}");
            let source_dir = ext.files_path.join(merge_dir);

            let entries = match std::fs::read_dir(&source_dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            let mut names: Vec<String> = entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();

            for name in names {
                let symlink_path = format!("{merge_dir_path}/{name}");
                /* Only the first wins, extensions are in priority order */
                if created_symlink.insert(symlink_path.clone()) {
                    let target = format!("{directory}/{merge_dir}/{name}");
                    stream.arg("--symlink").arg(&target).arg(&symlink_path);
                }
            }
        }
    }

    if !ld_library_path.is_empty() {
        let merged = match env.get("LD_LIBRARY_PATH").filter(|old| !old.is_empty()) {
            Some(old) => {
                if is_app {
                    // App extension dirs take precedence within the app
                    format!("{ld_library_path}:{old}")
                } else {
                    // The runtime's own search order stays in front
                    format!("{old}:{ld_library_path}")
                }
            }
            None => ld_library_path,
        };
        env.insert("LD_LIBRARY_PATH".to_string(), merged);
    }

    Ok(used_extensions)
}

fn parent_dir(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent.to_string(),
        _ => "/".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::{write_test_deploy, GROUP_RUNTIME, KEY_NAME};
    use std::fs;

    fn ext(installed_id: &str, directory: &str, files: PathBuf) -> Extension {
        Extension {
            id: installed_id.to_string(),
            installed_id: installed_id.to_string(),
            commit: None,
            files_path: files,
            directory: directory.to_string(),
            subdir_suffix: String::new(),
            add_ld_path: None,
            merge_dirs: Vec::new(),
            needs_tmpfs: false,
        }
    }

    #[test]
    fn test_binds_sorted_by_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let files = tmp.path().join("files");
        fs::create_dir(&files).unwrap();

        let extensions = vec![
            ext("org.example.B", "share/b/sub", files.clone()),
            ext("org.example.A", "share/b", files.clone()),
        ];
        let runtime = Ref::runtime("org.example.Platform", "x86_64", "1.0");
        let mut stream = ArgStream::new();
        let mut env = BTreeMap::new();

        add_extension_args(&mut stream, &mut env, &extensions, &runtime, true).unwrap();

        let args = stream.args_lossy();
        let parent = args.iter().position(|a| a == "/usr/share/b").unwrap();
        let child = args.iter().position(|a| a == "/usr/share/b/sub").unwrap();
        assert!(parent < child);
    }

    #[test]
    fn test_needs_tmpfs_emitted_once_per_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let files = tmp.path().join("files");
        fs::create_dir(&files).unwrap();

        let mut a = ext("org.example.GL.a", "lib/GL/a", files.clone());
        a.needs_tmpfs = true;
        let mut b = ext("org.example.GL.b", "lib/GL/b", files.clone());
        b.needs_tmpfs = true;

        let runtime = Ref::runtime("org.example.Platform", "x86_64", "1.0");
        let mut stream = ArgStream::new();
        let mut env = BTreeMap::new();
        add_extension_args(&mut stream, &mut env, &[a, b], &runtime, true).unwrap();

        let args = stream.args_lossy();
        let tmpfs_count = args.iter().filter(|a| *a == "/usr/lib/GL").count();
        assert_eq!(tmpfs_count, 1);
        let tmpfs_pos = args.iter().position(|a| a == "--tmpfs").unwrap();
        let bind_pos = args.iter().position(|a| a == "--ro-bind").unwrap();
        assert!(tmpfs_pos < bind_pos);
    }

    #[test]
    fn test_lock_file_for_ref_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let files = tmp.path().join("files");
        fs::create_dir(&files).unwrap();
        fs::write(files.join(".ref"), b"").unwrap();

        let extensions = vec![ext("org.example.Docs", "share/doc", files)];
        let runtime = Ref::runtime("org.example.Platform", "x86_64", "1.0");
        let mut stream = ArgStream::new();
        let mut env = BTreeMap::new();
        add_extension_args(&mut stream, &mut env, &extensions, &runtime, true).unwrap();

        let args = stream.args_lossy();
        let idx = args.iter().position(|a| a == "--lock-file").unwrap();
        assert_eq!(args[idx + 1], "/usr/share/doc/.ref");
    }

    #[test]
    fn test_ld_conf_fragment_naming_and_order() {
        let tmp = tempfile::tempdir().unwrap();
        let files = tmp.path().join("files");
        fs::create_dir(&files).unwrap();

        let mut first = ext("org.example.First", "ext/first", files.clone());
        first.add_ld_path = Some("lib".to_string());
        let mut second = ext("org.example.Second", "ext/second", files.clone());
        second.add_ld_path = Some("lib".to_string());

        let app = Ref::app("org.example.App", "x86_64", "stable");
        let mut stream = ArgStream::new();
        let mut env = BTreeMap::new();
        add_extension_args(&mut stream, &mut env, &[first, second], &app, true).unwrap();

        let args = stream.args_lossy();
        let confs: Vec<&String> = args
            .iter()
            .filter(|a| a.starts_with("/run/flatpak/ld.so.conf.d/"))
            .collect();
        assert_eq!(
            confs,
            vec![
                "/run/flatpak/ld.so.conf.d/app-001-org.example.First.conf",
                "/run/flatpak/ld.so.conf.d/app-002-org.example.Second.conf",
            ]
        );
        assert!(env.is_empty());
    }

    #[test]
    fn test_ld_library_path_without_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let files = tmp.path().join("files");
        fs::create_dir(&files).unwrap();

        let mut ext_a = ext("org.example.A", "ext/a", files.clone());
        ext_a.add_ld_path = Some("lib".to_string());

        // Runtime extensions go behind the existing search path
        let runtime = Ref::runtime("org.example.Platform", "x86_64", "1.0");
        let mut stream = ArgStream::new();
        let mut env = BTreeMap::new();
        env.insert("LD_LIBRARY_PATH".to_string(), "/app/lib".to_string());
        add_extension_args(&mut stream, &mut env, &[ext_a.clone()], &runtime, false).unwrap();
        assert_eq!(env["LD_LIBRARY_PATH"], "/app/lib:/usr/ext/a/lib");

        // App extensions go in front
        let app = Ref::app("org.example.App", "x86_64", "stable");
        let mut env = BTreeMap::new();
        env.insert("LD_LIBRARY_PATH".to_string(), "/app/lib".to_string());
        let mut stream = ArgStream::new();
        add_extension_args(&mut stream, &mut env, &[ext_a], &app, false).unwrap();
        assert_eq!(env["LD_LIBRARY_PATH"], "/app/ext/a/lib:/app/lib");
    }

    #[test]
    fn test_merge_dirs_first_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let files_a = tmp.path().join("a");
        let files_b = tmp.path().join("b");
        fs::create_dir_all(files_a.join("share/appdata")).unwrap();
        fs::create_dir_all(files_b.join("share/appdata")).unwrap();
        fs::write(files_a.join("share/appdata/common.xml"), b"a").unwrap();
        fs::write(files_b.join("share/appdata/common.xml"), b"b").unwrap();
        fs::write(files_b.join("share/appdata/only-b.xml"), b"b").unwrap();

        let mut ext_a = ext("org.example.A", "share/ext/A", files_a);
        ext_a.merge_dirs = vec!["share/appdata".to_string()];
        let mut ext_b = ext("org.example.B", "share/ext/B", files_b);
        ext_b.merge_dirs = vec!["share/appdata".to_string()];

        let runtime = Ref::runtime("org.example.Platform", "x86_64", "1.0");
        let mut stream = ArgStream::new();
        let mut env = BTreeMap::new();
        add_extension_args(&mut stream, &mut env, &[ext_a, ext_b], &runtime, true).unwrap();

        let args = stream.args_lossy();
        let common_targets: Vec<&String> = args
            .iter()
            .filter(|a| a.contains("common.xml") && a.starts_with("/usr/share/ext/"))
            .collect();
        // Only the higher-priority extension provides common.xml
        assert_eq!(common_targets, vec!["/usr/share/ext/A/share/appdata/common.xml"]);
        assert!(args.iter().any(|a| a == "/usr/share/ext/B/share/appdata/only-b.xml"));
    }

    #[test]
    fn test_summary_string() {
        let tmp = tempfile::tempdir().unwrap();
        let files = tmp.path().join("files");
        fs::create_dir(&files).unwrap();

        let mut with_commit = ext("org.example.A", "ext/a", files.clone());
        with_commit.commit = Some("deadbeef".to_string());
        let without_commit = ext("org.example.B", "ext/b", files);

        let runtime = Ref::runtime("org.example.Platform", "x86_64", "1.0");
        let mut stream = ArgStream::new();
        let mut env = BTreeMap::new();
        let summary =
            add_extension_args(&mut stream, &mut env, &[with_commit, without_commit], &runtime, true)
                .unwrap();
        assert_eq!(summary, "org.example.A=deadbeef;org.example.B=local");
    }

    #[test]
    fn test_list_extensions_from_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let origin = tmp.path().join("origin-files");
        fs::create_dir_all(origin.join("share/locale")).unwrap();

        let mut locale_meta = KeyFile::new();
        locale_meta.set_string(GROUP_RUNTIME, KEY_NAME, "org.example.Platform.Locale");
        write_test_deploy(
            tmp.path(),
            &Ref::runtime("org.example.Platform.Locale", "x86_64", "1.0"),
            "c0ffee",
            &locale_meta,
        )
        .unwrap();
        // Subdirectory refs of the GL extension point
        for sub in ["org.example.GL.nvidia", "org.example.GL.default"] {
            write_test_deploy(
                tmp.path(),
                &Ref::runtime(sub, "x86_64", "1.0"),
                "feed",
                &KeyFile::new(),
            )
            .unwrap();
        }

        let metakey = KeyFile::parse(
            "[Extension org.example.Platform.Locale]\n\
             directory=share/locale\n\
             \n\
             [Extension org.example.GL]\n\
             directory=lib/GL\n\
             subdirectories=true\n\
             add-ld-path=lib\n",
        )
        .unwrap();

        let store = DeployStore::with_base_dirs(vec![tmp.path().to_path_buf()]);
        let extensions = list_extensions(&metakey, "x86_64", "1.0", &store, &origin);

        assert_eq!(extensions.len(), 3);
        assert_eq!(extensions[0].installed_id, "org.example.Platform.Locale");
        assert!(!extensions[0].needs_tmpfs);
        // Subdirectory refs in id order, marked tmpfs (lib/GL missing in origin)
        assert_eq!(extensions[1].installed_id, "org.example.GL.default");
        assert_eq!(extensions[1].directory, "lib/GL/default");
        assert!(extensions[1].needs_tmpfs);
        assert_eq!(extensions[2].installed_id, "org.example.GL.nvidia");
        assert_eq!(extensions[2].add_ld_path.as_deref(), Some("lib"));
    }
}
