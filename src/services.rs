/// Session-bus service calls the launcher performs out of process: the
/// document portal, the a11y bus address lookup and transient-unit scope
/// placement. All of these degrade gracefully when the service is missing.
use std::os::fd::AsFd;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use zbus::blocking::Connection;
use zbus::zvariant::{Fd, OwnedObjectPath, Value};

use crate::types::{LaunchError, Result};

const PORTAL_BUS_NAME: &str = "org.freedesktop.portal.Documents";
const PORTAL_OBJECT_PATH: &str = "/org/freedesktop/portal/documents";
const PORTAL_INTERFACE: &str = "org.freedesktop.portal.Documents";

const A11Y_BUS_NAME: &str = "org.a11y.Bus";
const A11Y_OBJECT_PATH: &str = "/org/a11y/bus";

const SYSTEMD_BUS_NAME: &str = "org.freedesktop.systemd1";
const SYSTEMD_OBJECT_PATH: &str = "/org/freedesktop/systemd1";
const SYSTEMD_MANAGER_INTERFACE: &str = "org.freedesktop.systemd1.Manager";

/// How long to wait for the transient-unit job to settle. The signal-based
/// wait this replaces had no bound at all.
const JOB_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const JOB_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The document-portal operations the launcher needs; a trait so argument
/// forwarding is testable without a session bus.
pub trait DocumentPortal {
    /// Register `path` with the portal for `app_id` (read/write) and
    /// return the document id.
    fn add_document(&self, path: &Path, app_id: &str) -> Result<String>;
}

/// Shared session-bus connection, absent when no session bus is reachable.
pub struct SessionServices {
    connection: Option<Connection>,
}

impl SessionServices {
    pub fn connect() -> Self {
        let connection = match Connection::session() {
            Ok(conn) => Some(conn),
            Err(e) => {
                log::debug!("No session bus available: {e}");
                None
            }
        };
        SessionServices { connection }
    }

    #[cfg(test)]
    pub fn disconnected() -> Self {
        SessionServices { connection: None }
    }

    pub fn has_session_bus(&self) -> bool {
        self.connection.is_some()
    }

    /// The document portal mount point on the host, normally
    /// `$XDG_RUNTIME_DIR/doc`.
    pub fn document_mount_point(&self) -> Option<PathBuf> {
        let conn = self.connection.as_ref()?;
        let reply = conn
            .call_method(
                Some(PORTAL_BUS_NAME),
                PORTAL_OBJECT_PATH,
                Some(PORTAL_INTERFACE),
                "GetMountPoint",
                &(),
            )
            .map_err(|e| log::info!("Can't get document portal: {e}"))
            .ok()?;
        let mut bytes: Vec<u8> = reply.body().deserialize().ok()?;
        while bytes.last() == Some(&0) {
            bytes.pop();
        }
        if bytes.is_empty() {
            return None;
        }
        Some(PathBuf::from(std::ffi::OsString::from_vec(bytes)))
    }

    /// The accessibility bus address, from org.a11y.Bus.
    pub fn a11y_bus_address(&self) -> Option<String> {
        let conn = self.connection.as_ref()?;
        let reply = conn
            .call_method(Some(A11Y_BUS_NAME), A11Y_OBJECT_PATH, Some(A11Y_BUS_NAME), "GetAddress", &())
            .map_err(|e| log::debug!("Can't find a11y bus: {e}"))
            .ok()?;
        let address: String = reply.body().deserialize().ok()?;
        if address.is_empty() {
            None
        } else {
            Some(address)
        }
    }

    /// Move this process into a transient systemd scope so the app (which
    /// inherits it over exec) lands in its own cgroup. Waits for the job
    /// to settle, but never longer than the timeout.
    pub fn start_transient_unit(&self, app_id: &str) -> Result<()> {
        let conn = self
            .connection
            .as_ref()
            .ok_or_else(|| LaunchError::Config("No session bus, cgroups not available".to_string()))?;

        let pid = std::process::id();
        let name = format!("appbox-{app_id}-{pid}.scope");
        let properties: Vec<(&str, Value)> = vec![("PIDs", Value::from(vec![pid]))];
        let aux: Vec<(String, Vec<(String, Value)>)> = Vec::new();

        let reply = conn
            .call_method(
                Some(SYSTEMD_BUS_NAME),
                SYSTEMD_OBJECT_PATH,
                Some(SYSTEMD_MANAGER_INTERFACE),
                "StartTransientUnit",
                &(name.as_str(), "fail", properties, aux),
            )
            .map_err(|e| LaunchError::Config(format!("StartTransientUnit: {e}")))?;
        let job: OwnedObjectPath = reply
            .body()
            .deserialize()
            .map_err(|e| LaunchError::Config(format!("StartTransientUnit reply: {e}")))?;

        /* The job object disappears when it completes; poll it instead of
         * waiting on JobRemoved without a bound. */
        let deadline = Instant::now() + JOB_WAIT_TIMEOUT;
        while Instant::now() < deadline {
            let alive = conn
                .call_method(
                    Some(SYSTEMD_BUS_NAME),
                    job.as_str(),
                    Some("org.freedesktop.DBus.Properties"),
                    "Get",
                    &("org.freedesktop.systemd1.Job", "State"),
                )
                .is_ok();
            if !alive {
                return Ok(());
            }
            std::thread::sleep(JOB_POLL_INTERVAL);
        }

        log::warn!("Transient unit job {} did not settle in time", job.as_str());
        Ok(())
    }
}

impl DocumentPortal for SessionServices {
    fn add_document(&self, path: &Path, app_id: &str) -> Result<String> {
        let conn = self
            .connection
            .as_ref()
            .ok_or_else(|| LaunchError::Config("No session bus for document portal".to_string()))?;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_PATH | libc::O_CLOEXEC)
            .open(path)
            .map_err(LaunchError::file("open", path))?;

        let reply = conn
            .call_method(
                Some(PORTAL_BUS_NAME),
                PORTAL_OBJECT_PATH,
                Some(PORTAL_INTERFACE),
                "Add",
                &(Fd::from(file.as_fd()), true, false),
            )
            .map_err(|e| LaunchError::Config(format!("Documents.Add: {e}")))?;
        let doc_id: String = reply
            .body()
            .deserialize()
            .map_err(|e| LaunchError::Config(format!("Documents.Add reply: {e}")))?;

        conn.call_method(
            Some(PORTAL_BUS_NAME),
            PORTAL_OBJECT_PATH,
            Some(PORTAL_INTERFACE),
            "GrantPermissions",
            &(doc_id.as_str(), app_id, vec!["read", "write"]),
        )
        .map_err(|e| LaunchError::Config(format!("Documents.GrantPermissions: {e}")))?;

        Ok(doc_id)
    }
}
