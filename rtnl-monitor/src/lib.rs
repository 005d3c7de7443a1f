// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Route-monitor channel over a kernel `NETLINK_ROUTE` socket.
//!
//! The channel owns two sockets: a non-blocking event socket subscribed to
//! the link/IPv4-address/IPv4-route multicast groups, which feeds the local
//! caches and the registered event callbacks, and a blocking request socket
//! used for cache dumps and ACKed configuration submissions, so request
//! replies are never interleaved with multicast traffic.
//!
//! Reads made after a submission only observe the change once the relevant
//! cache has been refilled; the kernel's own notification for the change
//! still arrives through the multicast path and is not suppressed.

use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, RawFd};

use netlink_packet_core::{NetlinkBuffer, NetlinkMessage, NetlinkPayload};
use netlink_packet_route::RtnlMessage;
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use nix::errno::Errno;
use tracing::{debug, trace, warn};

mod cache;
mod request;

pub use cache::{AddrEntry, Caches, LinkEntry, RouteEntry};
pub use netlink_packet_route::constants::{
    IFF_BROADCAST, IFF_LOOPBACK, IFF_MULTICAST, IFF_RUNNING, IFF_UP,
};

// rtnetlink multicast group ids (RTNLGRP_*), joined via NETLINK_ADD_MEMBERSHIP.
const RTNLGRP_LINK: u32 = 1;
const RTNLGRP_IPV4_IFADDR: u32 = 5;
const RTNLGRP_IPV4_ROUTE: u32 = 7;

const RECV_BUF_CAPACITY: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum RtnlError {
    #[error("netlink socket error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to decode netlink message: {0}")]
    Decode(String),
    /// The kernel rejected a request; carries the errno text verbatim.
    #[error("{}", .0.desc())]
    Kernel(Errno),
    #[error("truncated netlink message stream")]
    Truncated,
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    New(LinkEntry),
    Del(LinkEntry),
}

#[derive(Debug, Clone)]
pub enum AddrEvent {
    New(AddrEntry),
    Del(AddrEntry),
}

#[derive(Debug, Clone)]
pub enum RouteEvent {
    New(RouteEntry),
    Del(RouteEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Links,
    Addresses,
    Routes,
}

type LinkCallback = Box<dyn FnMut(&Caches, &LinkEvent)>;
type AddrCallback = Box<dyn FnMut(&Caches, &AddrEvent)>;
type RouteCallback = Box<dyn FnMut(&Caches, &RouteEvent)>;

pub struct RouteMonitor {
    event_socket: Socket,
    request_socket: Socket,
    caches: Caches,
    seq: u32,
    link_cb: Option<LinkCallback>,
    addr_cb: Option<AddrCallback>,
    route_cb: Option<RouteCallback>,
}

impl RouteMonitor {
    /// Opens the channel: event socket bound and subscribed, request socket
    /// connected, all three caches filled. Any failure aborts the whole
    /// initialization; no partial channel is ever returned.
    pub fn open() -> Result<Self, RtnlError> {
        let mut event_socket = Socket::new(NETLINK_ROUTE)?;
        event_socket.bind_auto()?;
        event_socket.set_non_blocking(true)?;
        event_socket.add_membership(RTNLGRP_LINK)?;
        event_socket.add_membership(RTNLGRP_IPV4_IFADDR)?;
        event_socket.add_membership(RTNLGRP_IPV4_ROUTE)?;

        let mut request_socket = Socket::new(NETLINK_ROUTE)?;
        request_socket.bind_auto()?;
        request_socket.connect(&SocketAddr::new(0, 0))?;

        let mut monitor = RouteMonitor {
            event_socket,
            request_socket,
            caches: Caches::default(),
            seq: 0,
            link_cb: None,
            addr_cb: None,
            route_cb: None,
        };
        monitor.refill(CacheKind::Links)?;
        monitor.refill(CacheKind::Addresses)?;
        monitor.refill(CacheKind::Routes)?;
        debug!(
            links = monitor.caches.links().len(),
            addrs = monitor.caches.addrs().len(),
            routes = monitor.caches.routes().len(),
            "route monitor channel opened"
        );
        Ok(monitor)
    }

    /// Descriptor of the event socket, for reactor registration.
    pub fn socket_fd(&self) -> RawFd {
        self.event_socket.as_raw_fd()
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    pub fn interface_name(&self, index: u32) -> Option<String> {
        self.caches.link_by_index(index).map(|l| l.name.clone())
    }

    pub fn interface_index(&self, name: &str) -> Option<u32> {
        self.caches.link_by_name(name).map(|l| l.index)
    }

    pub fn set_link_callback(&mut self, cb: impl FnMut(&Caches, &LinkEvent) + 'static) {
        self.link_cb = Some(Box::new(cb));
    }

    pub fn set_addr_callback(&mut self, cb: impl FnMut(&Caches, &AddrEvent) + 'static) {
        self.addr_cb = Some(Box::new(cb));
    }

    pub fn set_route_callback(&mut self, cb: impl FnMut(&Caches, &RouteEvent) + 'static) {
        self.route_cb = Some(Box::new(cb));
    }

    /// Drains every pending message off the event socket, updating the caches
    /// and invoking the registered callbacks. Would-block and interrupted
    /// reads are absorbed; any other socket failure surfaces to the caller.
    pub fn process_ready(&mut self) -> Result<(), RtnlError> {
        let mut buf = Vec::with_capacity(RECV_BUF_CAPACITY);
        loop {
            buf.clear();
            match self.event_socket.recv(&mut buf, 0) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    let frame = &buf[..n];
                    if let Err(err) = self.dispatch_frame(frame) {
                        // A malformed frame poisons only itself.
                        debug!("dropping undecodable netlink frame: {err}");
                    }
                }
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    return Ok(())
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn dispatch_frame(&mut self, bytes: &[u8]) -> Result<(), RtnlError> {
        for_each_message(bytes, |msg| match msg.payload {
            NetlinkPayload::InnerMessage(inner) => self.apply_event(inner),
            NetlinkPayload::Done => {}
            NetlinkPayload::Error(err) => {
                warn!("kernel error on event socket: code {}", err.code)
            }
            _ => {}
        })
    }

    fn apply_event(&mut self, msg: RtnlMessage) {
        match msg {
            RtnlMessage::NewLink(link) => {
                let entry = LinkEntry::from(&link);
                trace!(iface = %entry.name, flags = format_args!("{:#x}", entry.flags), "link added or changed");
                self.caches.upsert_link(entry.clone());
                if let Some(cb) = self.link_cb.as_mut() {
                    cb(&self.caches, &LinkEvent::New(entry));
                }
            }
            RtnlMessage::DelLink(link) => {
                let entry = LinkEntry::from(&link);
                self.caches.remove_link(entry.index);
                if let Some(cb) = self.link_cb.as_mut() {
                    cb(&self.caches, &LinkEvent::Del(entry));
                }
            }
            RtnlMessage::NewAddress(addr) => {
                if let Ok(entry) = AddrEntry::try_from(&addr) {
                    self.caches.upsert_addr(entry);
                    if let Some(cb) = self.addr_cb.as_mut() {
                        cb(&self.caches, &AddrEvent::New(entry));
                    }
                }
            }
            RtnlMessage::DelAddress(addr) => {
                if let Ok(entry) = AddrEntry::try_from(&addr) {
                    self.caches.remove_addr(&entry);
                    if let Some(cb) = self.addr_cb.as_mut() {
                        cb(&self.caches, &AddrEvent::Del(entry));
                    }
                }
            }
            RtnlMessage::NewRoute(route) => {
                if let Ok(entry) = RouteEntry::try_from(&route) {
                    self.caches.upsert_route(entry);
                    if let Some(cb) = self.route_cb.as_mut() {
                        cb(&self.caches, &RouteEvent::New(entry));
                    }
                }
            }
            RtnlMessage::DelRoute(route) => {
                if let Ok(entry) = RouteEntry::try_from(&route) {
                    self.caches.remove_route(&entry);
                    if let Some(cb) = self.route_cb.as_mut() {
                        cb(&self.caches, &RouteEvent::Del(entry));
                    }
                }
            }
            other => {
                debug!("unhandled netlink message type {}", other.message_type());
            }
        }
    }

    /// Re-reads one cache's contents from the kernel. Required before any
    /// read that must observe a change submitted through this channel.
    pub fn refill(&mut self, kind: CacheKind) -> Result<(), RtnlError> {
        match kind {
            CacheKind::Links => {
                let mut links = Vec::new();
                self.dump(request::dump_links(), |msg| {
                    if let RtnlMessage::NewLink(link) = msg {
                        links.push(LinkEntry::from(&link));
                    }
                })?;
                self.caches.replace_links(links);
            }
            CacheKind::Addresses => {
                let mut addrs = Vec::new();
                self.dump(request::dump_addresses(), |msg| {
                    if let RtnlMessage::NewAddress(addr) = msg {
                        if let Ok(entry) = AddrEntry::try_from(&addr) {
                            addrs.push(entry);
                        }
                    }
                })?;
                self.caches.replace_addrs(addrs);
            }
            CacheKind::Routes => {
                let mut routes = Vec::new();
                self.dump(request::dump_routes(), |msg| {
                    if let RtnlMessage::NewRoute(route) = msg {
                        if let Ok(entry) = RouteEntry::try_from(&route) {
                            routes.push(entry);
                        }
                    }
                })?;
                self.caches.replace_routes(routes);
            }
        }
        Ok(())
    }

    pub fn submit_address_add(
        &mut self,
        ifindex: u32,
        addr: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), RtnlError> {
        self.execute_ack(request::new_address(ifindex, addr, prefix_len))
    }

    /// Deletes every IPv4 address the cache holds for `ifindex`. A kernel
    /// rejection of one entry aborts the remainder.
    pub fn submit_address_delete_all(&mut self, ifindex: u32) -> Result<(), RtnlError> {
        let targets: Vec<AddrEntry> = self.caches.addrs_for(ifindex).copied().collect();
        for target in targets {
            self.execute_ack(request::del_address(&target))?;
        }
        Ok(())
    }

    pub fn submit_default_route(
        &mut self,
        ifindex: u32,
        gateway: Ipv4Addr,
    ) -> Result<(), RtnlError> {
        self.execute_ack(request::default_route(ifindex, gateway))
    }

    pub fn change_link_flags(
        &mut self,
        ifindex: u32,
        set: u32,
        clear: u32,
    ) -> Result<(), RtnlError> {
        self.execute_ack(request::set_link_flags(ifindex, set, clear))
    }

    fn send_request(&mut self, msg: &mut NetlinkMessage<RtnlMessage>) -> Result<u32, RtnlError> {
        self.seq = self.seq.wrapping_add(1);
        msg.header.sequence_number = self.seq;
        msg.finalize();
        let mut buf = vec![0u8; msg.header.length as usize];
        msg.serialize(&mut buf[..]);
        self.request_socket.send(&buf, 0)?;
        Ok(self.seq)
    }

    /// Sends a dump request and feeds every inner message of the multipart
    /// reply to `collect`, until the kernel signals `NLMSG_DONE`.
    fn dump(
        &mut self,
        mut req: NetlinkMessage<RtnlMessage>,
        mut collect: impl FnMut(RtnlMessage),
    ) -> Result<(), RtnlError> {
        let seq = self.send_request(&mut req)?;
        let mut buf = Vec::with_capacity(RECV_BUF_CAPACITY);
        loop {
            buf.clear();
            let n = self.request_socket.recv(&mut buf, 0)?;
            let mut done = false;
            for_each_message(&buf[..n], |msg| {
                if msg.header.sequence_number != seq || done {
                    return;
                }
                match msg.payload {
                    NetlinkPayload::Done => done = true,
                    NetlinkPayload::Error(err) if err.code != 0 => {
                        warn!("kernel refused dump: code {}", err.code);
                        done = true;
                    }
                    NetlinkPayload::InnerMessage(inner) => collect(inner),
                    _ => {}
                }
            })?;
            if done {
                return Ok(());
            }
        }
    }

    /// Sends one request and blocks until the kernel's matching ACK or error
    /// arrives on the request socket.
    fn execute_ack(&mut self, mut req: NetlinkMessage<RtnlMessage>) -> Result<(), RtnlError> {
        let seq = self.send_request(&mut req)?;
        let mut buf = Vec::with_capacity(RECV_BUF_CAPACITY);
        loop {
            buf.clear();
            let n = self.request_socket.recv(&mut buf, 0)?;
            let mut outcome = None;
            for_each_message(&buf[..n], |msg| {
                if msg.header.sequence_number != seq || outcome.is_some() {
                    return;
                }
                match msg.payload {
                    NetlinkPayload::Error(err) if err.code != 0 => {
                        outcome = Some(Err(RtnlError::Kernel(Errno::from_raw(-err.code))));
                    }
                    NetlinkPayload::Error(_) | NetlinkPayload::Ack(_) | NetlinkPayload::Done => {
                        outcome = Some(Ok(()));
                    }
                    _ => {}
                }
            })?;
            if let Some(result) = outcome {
                return result;
            }
        }
    }
}

/// Walks a receive buffer that may hold several netlink messages, invoking
/// `f` for each decoded one. Message boundaries follow the length field,
/// advanced with NLMSG alignment.
fn for_each_message(
    bytes: &[u8],
    mut f: impl FnMut(NetlinkMessage<RtnlMessage>),
) -> Result<(), RtnlError> {
    let mut offset = 0;
    while offset < bytes.len() {
        let slice = &bytes[offset..];
        let header =
            NetlinkBuffer::new_checked(slice).map_err(|e| RtnlError::Decode(e.to_string()))?;
        let len = header.length() as usize;
        if len == 0 || len > slice.len() {
            return Err(RtnlError::Truncated);
        }
        let msg = NetlinkMessage::<RtnlMessage>::deserialize(&slice[..len])
            .map_err(|e| RtnlError::Decode(e.to_string()))?;
        f(msg);
        // NLMSG_ALIGNTO is 4.
        offset += (len + 3) & !3;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlink_packet_core::NLM_F_REQUEST;
    use netlink_packet_route::nlas::link;
    use netlink_packet_route::LinkMessage;

    fn serialized_link(index: u32, name: &str, seq: u32) -> Vec<u8> {
        let mut inner = LinkMessage::default();
        inner.header.index = index;
        inner.nlas.push(link::Nla::IfName(name.to_string()));
        let mut msg = NetlinkMessage::from(RtnlMessage::NewLink(inner));
        msg.header.flags = NLM_F_REQUEST;
        msg.header.sequence_number = seq;
        msg.finalize();
        let mut buf = vec![0u8; msg.header.length as usize];
        msg.serialize(&mut buf[..]);
        buf
    }

    #[test]
    fn walks_multiple_messages_in_one_buffer() {
        let mut bytes = serialized_link(1, "lo", 1);
        bytes.extend(serialized_link(2, "eth0", 2));
        let mut names = Vec::new();
        for_each_message(&bytes, |msg| {
            if let NetlinkPayload::InnerMessage(RtnlMessage::NewLink(link)) = msg.payload {
                names.push(LinkEntry::from(&link).name);
            }
        })
        .unwrap();
        assert_eq!(names, ["lo", "eth0"]);
    }

    #[test]
    fn truncated_buffer_is_an_error() {
        let bytes = serialized_link(1, "lo", 1);
        assert!(for_each_message(&bytes[..bytes.len() - 4], |_| {}).is_err());
    }

    #[test]
    fn open_fills_caches_coherently() {
        // Environments without a netlink-capable network namespace skip this.
        let Ok(monitor) = RouteMonitor::open() else {
            return;
        };
        for link in monitor.caches().links() {
            assert_eq!(monitor.interface_index(&link.name), Some(link.index));
            assert_eq!(monitor.interface_name(link.index).as_deref(), Some(link.name.as_str()));
        }
        for addr in monitor.caches().addrs() {
            assert!(addr.prefix_len <= 32);
        }
    }
}
