// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Control-socket server: a Unix stream listener plus the session table of
//! connected clients. One S-expression frame per read; every client receives
//! every broadcast notification.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::reactor::Reactor;
use crate::router::CommandRouter;

const READ_BUF_LEN: usize = 4096;
const SOCKET_MODE: u32 = 0o666;
const LISTEN_BACKLOG: libc::c_int = 5;

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    clients: RefCell<HashMap<RawFd, UnixStream>>,
}

impl ControlServer {
    /// Creates the listening socket: stale filesystem entries are unlinked,
    /// backlog 5 configured, permissions set so any local user can connect.
    pub fn bind(path: &Path) -> anyhow::Result<Self> {
        match fs::remove_file(path) {
            Ok(()) => debug!("removed stale control socket at {}", path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("unlinking {}", path.display()));
            }
        }
        let listener = listen_unix(path)
            .with_context(|| format!("binding control socket at {}", path.display()))?;
        listener.set_nonblocking(true)?;
        fs::set_permissions(path, fs::Permissions::from_mode(SOCKET_MODE))?;
        info!("control socket listening at {}", path.display());
        Ok(ControlServer {
            listener,
            path: path.to_path_buf(),
            clients: RefCell::new(HashMap::new()),
        })
    }

    pub fn listener_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Accepts one pending client, switches it to non-blocking mode and
    /// inserts it into the session table. Returns the new descriptor so the
    /// caller can register it for read-readiness.
    pub fn accept(&self) -> Option<RawFd> {
        match self.listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = stream.set_nonblocking(true) {
                    warn!("failed to set client non-blocking: {err}");
                    return None;
                }
                let fd = stream.as_raw_fd();
                self.clients.borrow_mut().insert(fd, stream);
                debug!("client connected, fd {fd}");
                Some(fd)
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => None,
            Err(err) => {
                warn!("accept on control socket failed: {err}");
                None
            }
        }
    }

    /// Services one read-readiness report for a client: reads a single
    /// command frame, routes it and writes the response back. Peer close,
    /// read errors and write failures all tear the session down.
    pub fn client_ready(&self, reactor: &Reactor, fd: RawFd, router: &CommandRouter) {
        let mut buf = [0u8; READ_BUF_LEN];
        let n = {
            let mut clients = self.clients.borrow_mut();
            let Some(stream) = clients.get_mut(&fd) else {
                return;
            };
            match stream.read(&mut buf) {
                Ok(0) => {
                    debug!("client fd {fd} closed the connection");
                    drop(clients);
                    self.teardown(reactor, fd);
                    return;
                }
                Ok(n) => n,
                Err(ref err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::Interrupted =>
                {
                    return;
                }
                Err(err) => {
                    warn!("read from client fd {fd} failed: {err}");
                    drop(clients);
                    self.teardown(reactor, fd);
                    return;
                }
            }
        };

        // The session table is released while the command runs: operations
        // may take a while (DHCP acquisition) and must not hold it.
        let response = router.dispatch(&buf[..n]);

        let write_failed = {
            let mut clients = self.clients.borrow_mut();
            match clients.get_mut(&fd) {
                Some(stream) => stream.write_all(response.as_bytes()).is_err(),
                None => false,
            }
        };
        if write_failed {
            debug!("write to client fd {fd} failed, dropping session");
            self.teardown(reactor, fd);
        }
    }

    /// Writes a pre-encoded notification frame to every live client. A
    /// client whose write fails is silently removed.
    pub fn broadcast(&self, reactor: &Reactor, frame: &str) {
        let fds: Vec<RawFd> = self.clients.borrow().keys().copied().collect();
        for fd in fds {
            let failed = {
                let mut clients = self.clients.borrow_mut();
                match clients.get_mut(&fd) {
                    Some(stream) => stream.write_all(frame.as_bytes()).is_err(),
                    None => false,
                }
            };
            if failed {
                self.teardown(reactor, fd);
            }
        }
    }

    fn teardown(&self, reactor: &Reactor, fd: RawFd) {
        // Deregistration must precede close; dropping the stream closes it.
        reactor.remove(fd);
        self.clients.borrow_mut().remove(&fd);
    }

    /// Deregisters and closes every descriptor, then unlinks the socket path.
    pub fn shutdown(&self, reactor: &Reactor) {
        let fds: Vec<RawFd> = self.clients.borrow().keys().copied().collect();
        for fd in fds {
            self.teardown(reactor, fd);
        }
        reactor.remove(self.listener.as_raw_fd());
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("failed to unlink {}: {err}", self.path.display());
            }
        }
        info!("control socket shut down");
    }

    pub fn client_count(&self) -> usize {
        self.clients.borrow().len()
    }
}

/// `socket`/`bind`/`listen` by hand: the std listener offers no control over
/// the backlog, and this one must be 5.
fn listen_unix(path: &Path) -> io::Result<UnixListener> {
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_os_str().as_bytes();
    // Leave room for the NUL terminator the zeroed struct already holds.
    if bytes.is_empty() || bytes.len() >= addr.sun_path.len() {
        unsafe { libc::close(fd) };
        return Err(io::Error::from(io::ErrorKind::InvalidInput));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let len = (std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1) as libc::socklen_t;
    let rc = unsafe { libc::bind(fd, &addr as *const libc::sockaddr_un as *const libc::sockaddr, len) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    if unsafe { libc::listen(fd, LISTEN_BACKLOG) } != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(unsafe { UnixListener::from_raw_fd(fd) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_replaces_stale_socket_and_sets_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        fs::write(&path, b"stale").unwrap();
        let server = ControlServer::bind(&path).unwrap();
        assert!(server.listener_fd() >= 0);
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, SOCKET_MODE);
    }

    #[test]
    fn accept_registers_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let server = ControlServer::bind(&path).unwrap();
        assert!(server.accept().is_none());

        let _client = UnixStream::connect(&path).unwrap();
        let fd = server.accept().expect("pending connection");
        assert!(fd >= 0);
        assert_eq!(server.client_count(), 1);
    }
}
