// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Daemon coordinator: builds every component, installs the signal handlers,
//! wires the route-monitor channel and the control server into the reactor
//! and runs the loop until a termination signal stops it.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::Context;
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use rtnl_monitor::RouteMonitor;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::control::ControlServer;
use crate::dhcp::DhcpcdClient;
use crate::netops::NetworkOps;
use crate::notify;
use crate::reactor::{handler, Interest, Reactor};
use crate::router::CommandRouter;

// Written once before the handlers are installed, read from signal context.
static STOP_EVENT_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_child_exit(_: libc::c_int) {
    // Reap every finished child so DHCP clients that exit on their own (or
    // race a dhcpOff) never linger as zombies. waitpid is async-signal-safe.
    loop {
        let pid = unsafe { libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
    }
}

extern "C" fn on_termination(_: libc::c_int) {
    let fd = STOP_EVENT_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let value: u64 = 1;
        unsafe {
            libc::write(fd, &value as *const u64 as *const libc::c_void, 8);
        }
    }
}

fn install_signal_handlers(stop_fd: RawFd) -> nix::Result<()> {
    STOP_EVENT_FD.store(stop_fd, Ordering::Relaxed);
    let reap = SigAction::new(
        SigHandler::Handler(on_child_exit),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    let term = SigAction::new(
        SigHandler::Handler(on_termination),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGCHLD, &reap)?;
        sigaction(Signal::SIGTERM, &term)?;
        sigaction(Signal::SIGINT, &term)?;
    }
    Ok(())
}

pub struct Daemon {
    config: Config,
    reactor: Reactor,
    monitor: Rc<RefCell<RouteMonitor>>,
    server: Rc<ControlServer>,
    router: Rc<CommandRouter>,
    /// Notification frames produced by monitor callbacks, drained and
    /// broadcast by the monitor's readiness handler.
    notifications: Rc<RefCell<VecDeque<String>>>,
    stop_event: EventFd,
}

impl Daemon {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let reactor = Reactor::new().context("creating reactor")?;
        let stop_event =
            EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
                .context("creating stop event")?;
        install_signal_handlers(stop_event.as_fd().as_raw_fd())
            .context("installing signal handlers")?;

        let monitor = Rc::new(RefCell::new(
            RouteMonitor::open().context("opening route monitor channel")?,
        ));
        let dhcp = DhcpcdClient::new(config.dhcp_client.clone(), config.dhcp_log_path.clone());
        let ops = NetworkOps::new(monitor.clone(), Box::new(dhcp), config.dhcp_timeout);
        let router = Rc::new(CommandRouter::new(ops));
        let server = Rc::new(ControlServer::bind(&config.socket_path)?);

        Ok(Daemon {
            config,
            reactor,
            monitor,
            server,
            router,
            notifications: Rc::new(RefCell::new(VecDeque::new())),
            stop_event,
        })
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        self.install_monitor_callbacks();
        self.register_stop_event()?;
        self.register_monitor()?;
        self.register_control_server()?;
        info!(
            "daemon running, control socket {}",
            self.config.socket_path.display()
        );
        let result = self.reactor.run();
        self.shutdown();
        result.context("readiness wait failed")
    }

    /// Callbacks are installed only here, after every component exists, so
    /// none of the construction paths ever observes a half-wired daemon.
    fn install_monitor_callbacks(&self) {
        let mut monitor = self.monitor.borrow_mut();
        let queue = self.notifications.clone();
        monitor.set_link_callback(move |_caches, event| {
            queue.borrow_mut().push_back(notify::link_frame(event));
        });
        let queue = self.notifications.clone();
        monitor.set_addr_callback(move |caches, event| {
            queue.borrow_mut().push_back(notify::addr_frame(caches, event));
        });
        let queue = self.notifications.clone();
        monitor.set_route_callback(move |_caches, event| {
            queue.borrow_mut().push_back(notify::route_frame(event));
        });
    }

    fn register_stop_event(&self) -> anyhow::Result<()> {
        let fd = self.stop_event.as_fd().as_raw_fd();
        self.reactor
            .add(
                fd,
                Interest::READABLE,
                handler(move |reactor, _fd, _readiness| {
                    info!("termination signal received, stopping");
                    reactor.stop();
                }),
            )
            .context("registering stop event")
    }

    fn register_monitor(&self) -> anyhow::Result<()> {
        let fd = self.monitor.borrow().socket_fd();
        let monitor = self.monitor.clone();
        let server = self.server.clone();
        let queue = self.notifications.clone();
        self.reactor
            .add(
                fd,
                Interest::READABLE,
                handler(move |reactor, fd, _readiness| {
                    if let Err(err) = monitor.borrow_mut().process_ready() {
                        // Degraded mode: only the live notification stream is
                        // lost. Commands keep working, submissions and cache
                        // refills go through the channel's request socket.
                        error!("route monitor failed: {err}; disabling kernel event stream");
                        reactor.remove(fd);
                    }
                    let mut queue = queue.borrow_mut();
                    while let Some(frame) = queue.pop_front() {
                        server.broadcast(reactor, &frame);
                    }
                }),
            )
            .context("registering route monitor")
    }

    fn register_control_server(&self) -> anyhow::Result<()> {
        let server = self.server.clone();
        let router = self.router.clone();
        self.reactor
            .add(
                self.server.listener_fd(),
                Interest::READABLE,
                handler(move |reactor, _fd, _readiness| {
                    while let Some(client_fd) = server.accept() {
                        let srv = server.clone();
                        let rtr = router.clone();
                        let registered = reactor.add(
                            client_fd,
                            Interest::READABLE,
                            handler(move |reactor, fd, _readiness| {
                                srv.client_ready(reactor, fd, &rtr);
                            }),
                        );
                        if let Err(err) = registered {
                            warn!("failed to register client fd {client_fd}: {err}");
                        }
                    }
                }),
            )
            .context("registering control server")
    }

    fn shutdown(&self) {
        info!("shutting down");
        self.server.shutdown(&self.reactor);
        let monitor_fd = self.monitor.borrow().socket_fd();
        self.reactor.remove(monitor_fd);
        // No supervised DHCP child survives shutdown.
        self.router.ops().borrow_mut().shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_against_a_live_kernel() {
        // Needs a netlink-capable environment; skipped elsewhere.
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            socket_path: dir.path().join("control.sock"),
            ..Config::default()
        };
        let daemon = match Daemon::new(config) {
            Ok(daemon) => daemon,
            Err(_) => return,
        };
        assert!(daemon.config.socket_path.exists());
        assert!(!daemon.monitor.borrow().caches().links().is_empty());
    }
}
