/// Refs and the deploy store: resolving a deployed app or runtime to its
/// files root, commit, metadata and overrides.
use std::fmt;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::keyfile::KeyFile;
use crate::types::{LaunchError, Result};

pub const GROUP_APPLICATION: &str = "Application";
pub const GROUP_RUNTIME: &str = "Runtime";
pub const KEY_NAME: &str = "name";
pub const KEY_RUNTIME: &str = "runtime";
pub const KEY_SDK: &str = "sdk";
pub const KEY_COMMAND: &str = "command";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    App,
    Runtime,
}

impl RefKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RefKind::App => "app",
            RefKind::Runtime => "runtime",
        }
    }
}

/// A fully qualified ref: `{app|runtime}/<id>/<arch>/<branch>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ref {
    pub kind: RefKind,
    pub id: String,
    pub arch: String,
    pub branch: String,
}

impl Ref {
    pub fn parse(full_ref: &str) -> Result<Self> {
        let parts: Vec<&str> = full_ref.split('/').collect();
        if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
            return Err(LaunchError::Deploy(format!(
                "Failed to determine parts from ref: {full_ref}"
            )));
        }
        let kind = match parts[0] {
            "app" => RefKind::App,
            "runtime" => RefKind::Runtime,
            other => {
                return Err(LaunchError::Deploy(format!(
                    "Invalid ref kind {other} in {full_ref}"
                )))
            }
        };
        Ok(Ref {
            kind,
            id: parts[1].to_string(),
            arch: parts[2].to_string(),
            branch: parts[3].to_string(),
        })
    }

    pub fn app(id: &str, arch: &str, branch: &str) -> Self {
        Ref {
            kind: RefKind::App,
            id: id.to_string(),
            arch: arch.to_string(),
            branch: branch.to_string(),
        }
    }

    pub fn runtime(id: &str, arch: &str, branch: &str) -> Self {
        Ref {
            kind: RefKind::Runtime,
            id: id.to_string(),
            arch: arch.to_string(),
            branch: branch.to_string(),
        }
    }

    /// Parse a runtime spec `<id>/<arch>/<branch>` as used by the metadata
    /// `runtime`/`sdk` keys, with each component optionally overridden.
    pub fn runtime_from_spec(
        spec: &str,
        custom: Option<&str>,
        custom_version: Option<&str>,
    ) -> Result<Self> {
        let mut parts: Vec<String> = spec.split('/').map(|s| s.to_string()).collect();
        if parts.len() != 3 {
            return Err(LaunchError::Deploy(format!(
                "Wrong number of components in runtime {spec}"
            )));
        }

        if let Some(custom) = custom {
            for (i, part) in custom.split('/').take(3).enumerate() {
                if !part.is_empty() {
                    parts[i] = part.to_string();
                }
            }
        }
        if let Some(version) = custom_version {
            parts[2] = version.to_string();
        }

        if parts.iter().any(|p| p.is_empty()) {
            return Err(LaunchError::Deploy(format!(
                "Incomplete runtime spec {spec}"
            )));
        }

        Ok(Ref::runtime(&parts[0], &parts[1], &parts[2]))
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.kind.as_str(), self.id, self.arch, self.branch)
    }
}

/// The architecture name used in refs for the running machine.
pub fn default_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x86_64",
        "x86" => "i386",
        "aarch64" => "aarch64",
        "arm" => "arm",
        other => other,
    }
}

/// Per-deploy record stored next to the deployed files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployData {
    pub commit: String,
    #[serde(default)]
    pub installed_size: u64,
}

/// One resolved deploy: files root, commit and parsed metadata.
#[derive(Debug, Clone)]
pub struct Deploy {
    pub deploy_ref: Ref,
    pub files: PathBuf,
    pub commit: String,
    pub metadata: KeyFile,
}

/// Locates deployed refs on disk. The store layout is
/// `<base>/<kind>/<id>/<arch>/<branch>/active/{files,metadata,deploy.json}`
/// with per-app overrides at `<base>/overrides/<id>`.
#[derive(Debug, Clone)]
pub struct DeployStore {
    base_dirs: Vec<PathBuf>,
}

impl DeployStore {
    /// The user store, plus the system store when present.
    pub fn default_locations() -> Self {
        let mut base_dirs = Vec::new();
        if let Some(data) = dirs::data_dir() {
            base_dirs.push(data.join("appbox"));
        }
        base_dirs.push(PathBuf::from("/var/lib/appbox"));
        DeployStore { base_dirs }
    }

    pub fn with_base_dirs(base_dirs: Vec<PathBuf>) -> Self {
        DeployStore { base_dirs }
    }

    /// The user install root. Hidden inside the sandbox by default.
    pub fn user_base_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("appbox"))
    }

    fn deploy_dir(&self, deploy_ref: &Ref) -> Option<PathBuf> {
        for base in &self.base_dirs {
            let dir = base
                .join(deploy_ref.kind.as_str())
                .join(&deploy_ref.id)
                .join(&deploy_ref.arch)
                .join(&deploy_ref.branch)
                .join("active");
            if dir.join("files").is_dir() {
                return Some(dir);
            }
        }
        None
    }

    pub fn is_deployed(&self, deploy_ref: &Ref) -> bool {
        self.deploy_dir(deploy_ref).is_some()
    }

    pub fn lookup(&self, deploy_ref: &Ref) -> Result<Deploy> {
        let dir = self.deploy_dir(deploy_ref).ok_or_else(|| {
            LaunchError::Deploy(format!("{deploy_ref} is not installed"))
        })?;

        let metadata_path = dir.join("metadata");
        let metadata = if metadata_path.exists() {
            let text = fs::read_to_string(&metadata_path)
                .map_err(LaunchError::file("read", &metadata_path))?;
            KeyFile::parse(&text)
                .map_err(|e| LaunchError::Deploy(format!("{}: {e}", metadata_path.display())))?
        } else {
            KeyFile::new()
        };

        let data_path = dir.join("deploy.json");
        let data: DeployData = {
            let text = fs::read_to_string(&data_path)
                .map_err(LaunchError::file("read", &data_path))?;
            serde_json::from_str(&text)
                .map_err(|e| LaunchError::Deploy(format!("{}: {e}", data_path.display())))?
        };

        Ok(Deploy {
            deploy_ref: deploy_ref.clone(),
            files: dir.join("files"),
            commit: data.commit,
            metadata,
        })
    }

    /// All deployed runtime refs whose id starts with `id_prefix`, matching
    /// arch and branch. Used to locate extension subdirectory refs.
    pub fn list_runtime_refs_with_prefix(
        &self,
        id_prefix: &str,
        arch: &str,
        branch: &str,
    ) -> Vec<Ref> {
        let mut refs = Vec::new();
        for base in &self.base_dirs {
            let kind_dir = base.join("runtime");
            let entries = match fs::read_dir(&kind_dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let id = entry.file_name().to_string_lossy().to_string();
                if !id.starts_with(id_prefix) {
                    continue;
                }
                let candidate = Ref::runtime(&id, arch, branch);
                if self.is_deployed(&candidate) && !refs.contains(&candidate) {
                    refs.push(candidate);
                }
            }
        }
        refs.sort_by(|a, b| a.id.cmp(&b.id));
        refs
    }

    /// Stored per-app overrides, parsed into a context for merging.
    pub fn load_overrides(&self, app_id: &str) -> Result<Option<Context>> {
        for base in &self.base_dirs {
            let path = base.join("overrides").join(app_id);
            match fs::read_to_string(&path) {
                Ok(text) => {
                    let context = Context::load_overrides(&text)
                        .map_err(|e| LaunchError::Config(format!("{}: {e}", path.display())))?;
                    return Ok(Some(context));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(LaunchError::file("read", &path)(e)),
            }
        }
        Ok(None)
    }
}

/// Per-app data directory (`~/.var/app/<id>`), without creating it.
pub fn get_data_dir(app_id: &str) -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".var/app").join(app_id))
}

/// Create the per-app data directory and its standard children.
pub fn ensure_data_dir(app_id: &str) -> Result<PathBuf> {
    let dir = get_data_dir(app_id)
        .ok_or_else(|| LaunchError::Deploy("No home directory".to_string()))?;

    for sub in ["data", "cache/fontconfig", "cache/tmp", "config"] {
        let path = dir.join(sub);
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&path)
            .map_err(LaunchError::file("mkdir", &path))?;
    }

    Ok(dir)
}

/// Write a minimal deploy into `base` for tests and local development.
pub fn write_test_deploy(
    base: &Path,
    deploy_ref: &Ref,
    commit: &str,
    metadata: &KeyFile,
) -> Result<PathBuf> {
    let dir = base
        .join(deploy_ref.kind.as_str())
        .join(&deploy_ref.id)
        .join(&deploy_ref.arch)
        .join(&deploy_ref.branch)
        .join("active");
    fs::create_dir_all(dir.join("files")).map_err(LaunchError::file("mkdir", dir.join("files")))?;
    fs::write(dir.join("metadata"), metadata.to_string())
        .map_err(LaunchError::file("write", dir.join("metadata")))?;
    let data = DeployData {
        commit: commit.to_string(),
        installed_size: 0,
    };
    let json = serde_json::to_string_pretty(&data)
        .map_err(|e| LaunchError::Deploy(e.to_string()))?;
    fs::write(dir.join("deploy.json"), json)
        .map_err(LaunchError::file("write", dir.join("deploy.json")))?;
    Ok(dir)
}
