//! Filesystem names derived from the net identifier.
//!
//! A daemon instance is selected by an optional short net name. All
//! on-disk locations (configuration tree, PID file, control socket) and
//! the log identity follow from it and are fixed for the lifetime of the
//! process.

use std::path::{Path, PathBuf};

/// Compile-time configuration root.
pub const CONFDIR: &str = "/etc";

/// Compile-time runtime directory for PID files and sockets.
pub const RUNDIR: &str = "/var/run";

/// Derived paths and identity for one daemon instance.
#[derive(Debug, Clone)]
pub struct Names {
    /// Net name this instance serves, if any.
    pub netname: Option<String>,
    /// Main configuration file.
    pub config_file: PathBuf,
    /// Directory holding the configuration tree and key material.
    pub config_base: PathBuf,
    /// PID lock file.
    pub pid_file: PathBuf,
    /// Control channel socket.
    pub control_socket: PathBuf,
    /// Identity tag for log output.
    pub identity: String,
}

impl Names {
    /// Derive all names for the given net.
    pub fn for_net(netname: Option<&str>) -> Self {
        Self::with_roots(netname, Path::new(CONFDIR), Path::new(RUNDIR))
    }

    /// Derive names against explicit roots. Used by tests and by `-c`.
    pub fn with_roots(netname: Option<&str>, confdir: &Path, rundir: &Path) -> Self {
        match netname {
            Some(net) => Self {
                netname: Some(net.to_string()),
                config_file: confdir.join("tinc").join(net).join("tincd.conf"),
                config_base: confdir.join("tinc").join(net),
                pid_file: rundir.join(format!("tincd.{net}.pid")),
                control_socket: rundir.join(format!("tincd.{net}.sock")),
                identity: format!("tincd.{net}"),
            },
            None => Self {
                netname: None,
                config_file: confdir.join("tinc").join("tincd.conf"),
                config_base: confdir.join("tinc"),
                pid_file: rundir.join("tincd.pid"),
                control_socket: rundir.join("tincd.sock"),
                identity: "tincd".to_string(),
            },
        }
    }

    /// Replace the configuration file location (from `-c FILE`). The
    /// configuration base directory follows the file.
    pub fn override_config_file(&mut self, file: &Path) {
        self.config_file = file.to_path_buf();
        if let Some(parent) = file.parent() {
            self.config_base = parent.to_path_buf();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_without_net() {
        let names = Names::for_net(None);
        assert_eq!(names.config_file, PathBuf::from("/etc/tinc/tincd.conf"));
        assert_eq!(names.pid_file, PathBuf::from("/var/run/tincd.pid"));
        assert_eq!(names.control_socket, PathBuf::from("/var/run/tincd.sock"));
        assert_eq!(names.identity, "tincd");
    }

    #[test]
    fn test_names_with_net() {
        let names = Names::for_net(Some("v1"));
        assert_eq!(names.config_file, PathBuf::from("/etc/tinc/v1/tincd.conf"));
        assert_eq!(names.config_base, PathBuf::from("/etc/tinc/v1"));
        assert_eq!(names.pid_file, PathBuf::from("/var/run/tincd.v1.pid"));
        assert_eq!(names.control_socket, PathBuf::from("/var/run/tincd.v1.sock"));
        assert_eq!(names.identity, "tincd.v1");
    }

    #[test]
    fn test_config_file_override_moves_base() {
        let mut names = Names::for_net(Some("v1"));
        names.override_config_file(Path::new("/opt/custom/tincd.conf"));
        assert_eq!(names.config_file, PathBuf::from("/opt/custom/tincd.conf"));
        assert_eq!(names.config_base, PathBuf::from("/opt/custom"));
        // Runtime paths are unaffected.
        assert_eq!(names.pid_file, PathBuf::from("/var/run/tincd.v1.pid"));
    }
}
