/// On-demand generation of the small configuration files handed into the
/// sandbox as anonymous fds: passwd/group, ld.so.conf, the filtered X
/// authority file, the PulseAudio client config and user-dirs.dirs.
use std::io::Read;
use std::path::PathBuf;

use nix::unistd::{Gid, Group, Uid, User};

use crate::types::{LaunchError, Result};

pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Contents of the sandbox /etc/ld.so.conf. The runtime include comes last
/// so runtime libraries win over /app/lib unless an app fragment overrides
/// them.
pub const LD_SO_CONF: &str = "include /run/flatpak/ld.so.conf.d/app-*.conf\n\
include /app/etc/ld.so.conf\n\
/app/lib\n\
include /run/flatpak/ld.so.conf.d/runtime-*.conf\n";

/// PulseAudio client configuration; shared memory stays off because the
/// sandbox and the daemon do not share /dev/shm.
pub const PULSE_CLIENT_CONFIG: &str = "enable-shm=no\n";

/// The invoking user, as it should appear inside the sandbox.
#[derive(Debug, Clone)]
pub struct UserInfo {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: PathBuf,
    pub group_name: String,
}

impl UserInfo {
    pub fn current() -> Result<Self> {
        let uid = Uid::current();
        let gid = Gid::current();
        let user = User::from_uid(uid)
            .map_err(LaunchError::from)?
            .ok_or_else(|| LaunchError::Config(format!("uid {uid} has no passwd entry")))?;
        let group_name = Group::from_gid(gid)
            .ok()
            .flatten()
            .map(|g| g.name)
            .unwrap_or_else(|| user.name.clone());

        Ok(UserInfo {
            name: user.name,
            uid: uid.as_raw(),
            gid: gid.as_raw(),
            gecos: user.gecos.to_string_lossy().into_owned(),
            home: user.dir,
            group_name,
        })
    }
}

/// Two passwd lines: the invoking user and an unmapped-nobody entry.
pub fn passwd_contents(user: &UserInfo) -> String {
    format!(
        "{}:x:{}:{}:{}:{}:{}\nnfsnobody:x:65534:65534:Unmapped user:/:/sbin/nologin\n",
        user.name,
        user.uid,
        user.gid,
        user.gecos,
        user.home.display(),
        DEFAULT_SHELL,
    )
}

pub fn group_contents(user: &UserInfo) -> String {
    format!(
        "{}:x:{}:{}\nnfsnobody:x:65534:\n",
        user.group_name, user.gid, user.name,
    )
}

/// user-dirs.dirs synthesized from the xdg dirs the context actually
/// granted.
pub fn user_dirs_contents(entries: &[(String, PathBuf)]) -> String {
    let mut out = String::new();
    for (config_key, path) in entries {
        out.push_str(&format!("{}=\"{}\"\n", config_key, path.display()));
    }
    out
}

/* X authority records, big-endian u16 length-prefixed fields. */

const XAUTH_FAMILY_LOCAL: u16 = 256;
const XAUTH_FAMILY_WILD: u16 = 65535;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XauthEntry {
    pub family: u16,
    pub address: Vec<u8>,
    pub number: Vec<u8>,
    pub name: Vec<u8>,
    pub data: Vec<u8>,
}

fn read_u16(r: &mut impl Read) -> std::io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_field(r: &mut impl Read) -> std::io::Result<Vec<u8>> {
    let len = read_u16(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_entry(r: &mut impl Read) -> Option<XauthEntry> {
    let family = read_u16(r).ok()?;
    let address = read_field(r).ok()?;
    let number = read_field(r).ok()?;
    let name = read_field(r).ok()?;
    let data = read_field(r).ok()?;
    Some(XauthEntry {
        family,
        address,
        number,
        name,
        data,
    })
}

fn write_field(out: &mut Vec<u8>, field: &[u8]) {
    out.extend_from_slice(&(field.len() as u16).to_be_bytes());
    out.extend_from_slice(field);
}

fn write_entry(out: &mut Vec<u8>, entry: &XauthEntry) {
    out.extend_from_slice(&entry.family.to_be_bytes());
    write_field(out, &entry.address);
    write_field(out, &entry.number);
    write_field(out, &entry.name);
    write_field(out, &entry.data);
}

fn entry_should_propagate(entry: &XauthEntry, hostname: &[u8], display: &[u8]) -> bool {
    // No remote entries
    if entry.family != XAUTH_FAMILY_LOCAL && entry.family != XAUTH_FAMILY_WILD {
        return false;
    }
    // Local entries must be for this machine
    if entry.family == XAUTH_FAMILY_LOCAL && entry.address != hostname {
        return false;
    }
    // And for this session
    if !entry.number.is_empty() && entry.number != display {
        return false;
    }
    true
}

/// Filter the host's X authority entries down to the ones valid for this
/// machine and display, rewriting each kept entry to display 99 (where the
/// X socket is bound inside the sandbox).
pub fn filtered_xauth_data(host_auth: &mut impl Read, hostname: &str, display: &str) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(entry) = read_entry(host_auth) {
        if !entry_should_propagate(&entry, hostname.as_bytes(), display.as_bytes()) {
            continue;
        }
        let mut rewritten = entry;
        if !rewritten.number.is_empty() {
            rewritten.number = b"99".to_vec();
        }
        write_entry(&mut out, &rewritten);
    }
    out
}

/// The host X authority file: $XAUTHORITY, or ~/.Xauthority.
pub fn xauth_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("XAUTHORITY") {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".Xauthority"))
}

/// The machine's hostname, for matching local xauth entries.
pub fn hostname() -> Result<String> {
    let uname = nix::sys::utsname::uname().map_err(LaunchError::from)?;
    Ok(uname.nodename().to_string_lossy().into_owned())
}
