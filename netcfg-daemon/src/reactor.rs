// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single-threaded, level-triggered readiness reactor over epoll.
//!
//! The reactor never owns the descriptors it watches; owners must deregister
//! before closing. Handlers may re-enter the reactor (add/modify/remove)
//! while being dispatched: the handler table lives behind a `RefCell` and the
//! handler itself is cloned out of the table before the call.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use tracing::warn;

/// Readiness interest, mio-style: a tiny set over {readable, writable}.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READABLE: Interest = Interest(0b01);
    pub const WRITABLE: Interest = Interest(0b10);

    pub const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    pub const fn is_readable(self) -> bool {
        self.0 & 0b01 != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & 0b10 != 0
    }

    fn epoll_flags(self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.is_readable() {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.is_writable() {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }
}

/// What the kernel reported for a dispatched descriptor. Hang-up and error
/// conditions surface as readable so owners observe them through a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    fn from_epoll(flags: EpollFlags) -> Self {
        Readiness {
            readable: flags
                .intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR),
            writable: flags.intersects(EpollFlags::EPOLLOUT),
        }
    }
}

pub type Handler = Rc<RefCell<dyn FnMut(&Reactor, RawFd, Readiness)>>;

/// Wraps a closure into the reactor's handler representation.
pub fn handler(f: impl FnMut(&Reactor, RawFd, Readiness) + 'static) -> Handler {
    Rc::new(RefCell::new(f))
}

// The waker's slot in the epoll user-data space; real descriptors use their
// own fd value, which is never negative.
const WAKER_TOKEN: u64 = u64::MAX;

const MAX_EVENTS: usize = 16;

pub struct Reactor {
    epoll: Epoll,
    handlers: RefCell<HashMap<RawFd, Handler>>,
    running: Cell<bool>,
    waker: EventFd,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let waker = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        epoll.add(&waker, EpollEvent::new(EpollFlags::EPOLLIN, WAKER_TOKEN))?;
        Ok(Reactor {
            epoll,
            handlers: RefCell::new(HashMap::new()),
            running: Cell::new(true),
            waker,
        })
    }

    /// Registers `fd` for `interest`. Fails if `fd` is negative or already
    /// registered. Registration is level-triggered and persistent.
    pub fn add(&self, fd: RawFd, interest: Interest, handler: Handler) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        let mut handlers = self.handlers.borrow_mut();
        if handlers.contains_key(&fd) {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .add(borrowed, EpollEvent::new(interest.epoll_flags(), fd as u64))?;
        handlers.insert(fd, handler);
        Ok(())
    }

    /// Atomically replaces the interest set and, when given, the handler of a
    /// registered descriptor.
    pub fn modify(&self, fd: RawFd, interest: Interest, handler: Option<Handler>) -> io::Result<()> {
        let mut handlers = self.handlers.borrow_mut();
        if !handlers.contains_key(&fd) {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut event = EpollEvent::new(interest.epoll_flags(), fd as u64);
        self.epoll.modify(borrowed, &mut event)?;
        if let Some(handler) = handler {
            handlers.insert(fd, handler);
        }
        Ok(())
    }

    /// Deregisters `fd`; returns whether it was registered. Safe to call for
    /// unknown descriptors, and from inside a handler.
    pub fn remove(&self, fd: RawFd) -> bool {
        let removed = self.handlers.borrow_mut().remove(&fd).is_some();
        if removed {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            if let Err(err) = self.epoll.delete(borrowed) {
                // The owner may already have closed the fd; the registration
                // is gone either way.
                warn!("epoll delete for fd {fd} failed: {err}");
            }
        }
        removed
    }

    /// Dispatches ready events until `stop` is observed. A signal interrupting
    /// the wait resumes the loop; any other wait failure is fatal.
    pub fn run(&self) -> io::Result<()> {
        while self.running.get() {
            let mut events = [EpollEvent::empty(); MAX_EVENTS];
            let n = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            };
            for event in &events[..n] {
                if event.data() == WAKER_TOKEN {
                    let _ = self.waker.read();
                    continue;
                }
                let fd = event.data() as RawFd;
                // Re-check registration: a handler earlier in this batch may
                // have removed this descriptor.
                let entry = self.handlers.borrow().get(&fd).cloned();
                let Some(entry) = entry else { continue };
                (&mut *entry.borrow_mut())(self, fd, Readiness::from_epoll(event.events()));
            }
        }
        Ok(())
    }

    /// Idempotent; wakes a blocked `run` so it can observe the flag and
    /// return.
    pub fn stop(&self) {
        self.running.set(false);
        let _ = self.waker.arm();
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.handlers.borrow().contains_key(&fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn add_rejects_negative_and_duplicate_fds() {
        let reactor = Reactor::new().unwrap();
        assert!(reactor.add(-1, Interest::READABLE, handler(|_, _, _| {})).is_err());

        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        reactor.add(fd, Interest::READABLE, handler(|_, _, _| {})).unwrap();
        assert!(reactor.add(fd, Interest::READABLE, handler(|_, _, _| {})).is_err());
    }

    #[test]
    fn remove_reports_registration() {
        let reactor = Reactor::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        assert!(!reactor.remove(fd));
        reactor.add(fd, Interest::READABLE, handler(|_, _, _| {})).unwrap();
        assert!(reactor.remove(fd));
        assert!(!reactor.remove(fd));
    }

    #[test]
    fn modify_requires_registration() {
        let reactor = Reactor::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        assert!(reactor.modify(fd, Interest::WRITABLE, None).is_err());
        reactor.add(fd, Interest::READABLE, handler(|_, _, _| {})).unwrap();
        reactor.modify(fd, Interest::READABLE.add(Interest::WRITABLE), None).unwrap();
    }

    #[test]
    fn dispatches_readable_handler_and_stops() {
        let reactor = Reactor::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let hits = Rc::new(Cell::new(0));
        let counted = hits.clone();
        reactor
            .add(
                fd,
                Interest::READABLE,
                handler(move |reactor, fd, readiness| {
                    assert!(readiness.readable);
                    counted.set(counted.get() + 1);
                    reactor.remove(fd);
                    reactor.stop();
                }),
            )
            .unwrap();
        b.write_all(b"x").unwrap();
        reactor.run().unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn removed_descriptor_is_not_dispatched_in_same_batch() {
        let reactor = Reactor::new().unwrap();
        let (a1, mut b1) = UnixStream::pair().unwrap();
        let (a2, mut b2) = UnixStream::pair().unwrap();
        let fd1 = a1.as_raw_fd();
        let fd2 = a2.as_raw_fd();
        let dispatched = Rc::new(Cell::new(0));

        // Each handler removes the other: whichever runs first wins and the
        // loser must not be dispatched afterwards.
        let d = dispatched.clone();
        reactor
            .add(
                fd1,
                Interest::READABLE,
                handler(move |reactor, _, _| {
                    d.set(d.get() + 1);
                    reactor.remove(fd2);
                    reactor.stop();
                }),
            )
            .unwrap();
        let d = dispatched.clone();
        reactor
            .add(
                fd2,
                Interest::READABLE,
                handler(move |reactor, _, _| {
                    d.set(d.get() + 1);
                    reactor.remove(fd1);
                    reactor.stop();
                }),
            )
            .unwrap();

        b1.write_all(b"x").unwrap();
        b2.write_all(b"x").unwrap();
        reactor.run().unwrap();
        assert_eq!(dispatched.get(), 1);
    }

    #[test]
    fn stop_is_idempotent_and_ends_run() {
        let reactor = Reactor::new().unwrap();
        reactor.stop();
        reactor.stop();
        reactor.run().unwrap();
    }

    #[test]
    fn reentrant_add_from_handler() {
        let reactor = Reactor::new().unwrap();
        let (a1, mut b1) = UnixStream::pair().unwrap();
        let (a2, mut b2) = UnixStream::pair().unwrap();
        let fd1 = a1.as_raw_fd();
        let fd2 = a2.as_raw_fd();
        let second_hit = Rc::new(Cell::new(false));

        let flag = second_hit.clone();
        reactor
            .add(
                fd1,
                Interest::READABLE,
                handler(move |reactor, fd, _| {
                    reactor.remove(fd);
                    let flag = flag.clone();
                    reactor
                        .add(
                            fd2,
                            Interest::READABLE,
                            handler(move |reactor, _, _| {
                                flag.set(true);
                                reactor.stop();
                            }),
                        )
                        .unwrap();
                }),
            )
            .unwrap();

        b1.write_all(b"x").unwrap();
        b2.write_all(b"x").unwrap();
        reactor.run().unwrap();
        assert!(second_hit.get());
    }
}
