// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! DHCP client supervision: one child process per interface, tracked by name
//! and guaranteed to be terminated on shutdown.

use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{execvp, fork, ForkResult, Pid};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DhcpError {
    #[error("fork failed")]
    Fork(#[source] nix::Error),
    #[error("dhcpcd failed")]
    Launch,
}

/// Capability set the network-operations façade needs from a DHCP client.
/// The process-backed implementation is the default; tests use the stub.
pub trait DhcpClient {
    /// Launches a client for `ifname` and returns the supervised child's pid.
    fn start(&mut self, ifname: &str) -> Result<Pid, DhcpError>;
    /// Terminates the client for `ifname` if one is tracked; returns whether
    /// anything was stopped. Safe to call when nothing is running.
    fn stop(&mut self, ifname: &str) -> bool;
    fn is_running(&self, ifname: &str) -> bool;
    /// Terminates and reaps every tracked client.
    fn shutdown(&mut self);
}

/// Forks and execs the external `dhcpcd` binary per interface.
pub struct DhcpcdClient {
    binary: String,
    log_path: PathBuf,
    children: HashMap<String, Pid>,
}

impl DhcpcdClient {
    pub fn new(binary: impl Into<String>, log_path: impl Into<PathBuf>) -> Self {
        DhcpcdClient {
            binary: binary.into(),
            log_path: log_path.into(),
            children: HashMap::new(),
        }
    }

    fn reap(pid: Pid) {
        match waitpid(pid, None) {
            Ok(_) => {}
            // The SIGCHLD reaper can win the race for an already-dead child.
            Err(Errno::ECHILD) => {}
            Err(err) => warn!("waitpid for dhcp child {pid} failed: {err}"),
        }
    }
}

impl DhcpClient for DhcpcdClient {
    fn start(&mut self, ifname: &str) -> Result<Pid, DhcpError> {
        // Everything the child needs is allocated before the fork; the child
        // side only runs async-signal-safe calls until exec.
        let argv: Vec<CString> = [self.binary.as_str(), "-d", "-B", ifname]
            .iter()
            .map(|arg| CString::new(*arg))
            .collect::<Result<_, _>>()
            .map_err(|_| DhcpError::Launch)?;
        let log_path = CString::new(self.log_path.as_os_str().as_encoded_bytes())
            .map_err(|_| DhcpError::Launch)?;

        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                close_inherited_descriptors();
                redirect_stdio(&log_path);
                let _ = execvp(&argv[0], &argv);
                unsafe { libc::_exit(127) }
            }
            Ok(ForkResult::Parent { child }) => {
                info!("started {} for {ifname}, pid {child}", self.binary);
                self.children.insert(ifname.to_string(), child);
                Ok(child)
            }
            Err(err) => Err(DhcpError::Fork(err)),
        }
    }

    fn stop(&mut self, ifname: &str) -> bool {
        let Some(pid) = self.children.remove(ifname) else {
            return false;
        };
        info!("stopping dhcp client for {ifname}, pid {pid}");
        if let Err(err) = kill(pid, Signal::SIGTERM) {
            warn!("failed to signal dhcp child {pid}: {err}");
        }
        Self::reap(pid);
        true
    }

    fn is_running(&self, ifname: &str) -> bool {
        match self.children.get(ifname) {
            // Signal 0 probes for existence without delivering anything.
            Some(pid) => kill(*pid, None).is_ok(),
            None => false,
        }
    }

    fn shutdown(&mut self) {
        for (ifname, pid) in self.children.drain() {
            info!("terminating dhcp client for {ifname}, pid {pid}");
            let _ = kill(pid, Signal::SIGTERM);
            Self::reap(pid);
        }
    }
}

/// Deterministic stand-in: records which interfaces are "running" without
/// spawning processes. Used by tests.
#[derive(Debug, Default)]
pub struct StubDhcpClient {
    running: HashSet<String>,
}

impl DhcpClient for StubDhcpClient {
    fn start(&mut self, ifname: &str) -> Result<Pid, DhcpError> {
        self.running.insert(ifname.to_string());
        // There is no process behind the stub; pid 0 marks the fabrication.
        Ok(Pid::from_raw(0))
    }

    fn stop(&mut self, ifname: &str) -> bool {
        self.running.remove(ifname)
    }

    fn is_running(&self, ifname: &str) -> bool {
        self.running.contains(ifname)
    }

    fn shutdown(&mut self) {
        self.running.clear();
    }
}

/// Child-side launch hygiene: drop every inherited descriptor above stdio so
/// the DHCP client cannot touch the daemon's sockets.
fn close_inherited_descriptors() {
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let max = if max < 0 { 1024 } else { max as libc::c_int };
    for fd in 3..max {
        unsafe { libc::close(fd) };
    }
}

/// Points the child's stdout/stderr at the configured log file, append mode.
fn redirect_stdio(log_path: &std::ffi::CStr) {
    unsafe {
        let fd = libc::open(
            log_path.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND,
            0o644,
        );
        if fd >= 0 {
            libc::dup2(fd, libc::STDOUT_FILENO);
            libc::dup2(fd, libc::STDERR_FILENO);
            if fd > libc::STDERR_FILENO {
                libc::close(fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_tracks_running_state() {
        let mut stub = StubDhcpClient::default();
        assert!(!stub.is_running("eth0"));
        stub.start("eth0").unwrap();
        assert!(stub.is_running("eth0"));
        assert!(stub.stop("eth0"));
        assert!(!stub.stop("eth0"));
        assert!(!stub.is_running("eth0"));
    }

    #[test]
    fn stub_shutdown_clears_everything() {
        let mut stub = StubDhcpClient::default();
        stub.start("eth0").unwrap();
        stub.start("eth1").unwrap();
        stub.shutdown();
        assert!(!stub.is_running("eth0"));
        assert!(!stub.is_running("eth1"));
    }

    #[test]
    fn process_client_stop_without_child_is_a_noop() {
        let mut client = DhcpcdClient::new("dhcpcd", "/tmp/dhcpcd.log");
        assert!(!client.stop("eth0"));
        assert!(!client.is_running("eth0"));
    }

    #[test]
    fn process_client_tracks_and_reaps_real_child() {
        // `sleep` stands in for dhcpcd; it exits on the extra flags, which is
        // fine — the supervision entry must exist until stop() reaps it.
        let dir = tempfile::tempdir().unwrap();
        let mut client = DhcpcdClient::new("sleep", dir.path().join("log"));
        client.start("30").unwrap();
        assert!(client.stop("30"));
        assert!(!client.is_running("30"));
        assert!(!client.stop("30"));
    }
}
