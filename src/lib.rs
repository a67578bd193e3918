//! appbox: an application sandbox launcher core
//!
//! Composes a permission context from deploy metadata and user overrides,
//! plans the filesystem exposure, spawns filtering bus proxies, regenerates
//! the dynamic-linker cache and finally drives an unprivileged container
//! executor (bwrap) with a fully specified argument stream and fd set.

pub mod appinfo;
pub mod argstream;
pub mod blobs;
pub mod busproxy;
pub mod cli;
pub mod context;
pub mod deploy;
pub mod exposure;
pub mod extensions;
pub mod keyfile;
pub mod launcher;
pub mod ldcache;
pub mod seccomp;
pub mod services;
pub mod types;
