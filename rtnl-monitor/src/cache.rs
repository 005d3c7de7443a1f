// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::Ipv4Addr;

use netlink_packet_route::constants::AF_INET;
use netlink_packet_route::nlas::{address, link, route};
use netlink_packet_route::{AddressMessage, LinkMessage, RouteMessage};

/// One kernel link, as observed through `RTM_NEWLINK`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
    pub index: u32,
    pub name: String,
    /// Raw `IFF_*` flag word.
    pub flags: u32,
    /// Hardware address; absent for pseudo-devices that carry no `IFLA_ADDRESS`.
    pub mac: Option<[u8; 6]>,
}

impl LinkEntry {
    pub fn is_up(&self) -> bool {
        self.flags & netlink_packet_route::constants::IFF_UP != 0
    }
}

/// One IPv4 address assignment, as observed through `RTM_NEWADDR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrEntry {
    pub index: u32,
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

/// One IPv4 route, as observed through `RTM_NEWROUTE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub dst: Option<Ipv4Addr>,
    pub dst_prefix_len: u8,
    pub gateway: Option<Ipv4Addr>,
    pub oif: Option<u32>,
    pub table: u8,
    pub scope: u8,
    pub protocol: u8,
}

impl RouteEntry {
    /// Destination prefix length zero means this is the default route.
    pub fn is_default(&self) -> bool {
        self.dst_prefix_len == 0
    }
}

impl From<&LinkMessage> for LinkEntry {
    fn from(msg: &LinkMessage) -> Self {
        let mut name = None;
        let mut mac = None;
        for nla in &msg.nlas {
            match nla {
                link::Nla::IfName(ifname) => name = Some(ifname.clone()),
                link::Nla::Address(bytes) if bytes.len() == 6 => {
                    let mut hw = [0u8; 6];
                    hw.copy_from_slice(bytes);
                    mac = Some(hw);
                }
                _ => {}
            }
        }
        LinkEntry {
            index: msg.header.index,
            name: name.unwrap_or_else(|| format!("unknown-{}", msg.header.index)),
            flags: msg.header.flags,
            mac,
        }
    }
}

impl TryFrom<&AddressMessage> for AddrEntry {
    type Error = ();

    fn try_from(msg: &AddressMessage) -> Result<Self, ()> {
        if u16::from(msg.header.family) != AF_INET {
            return Err(());
        }
        // IFA_LOCAL is the authoritative local address; fall back to
        // IFA_ADDRESS, which is what the kernel sets for broadcast links.
        let mut local = None;
        let mut address = None;
        for nla in &msg.nlas {
            match nla {
                address::Nla::Local(bytes) if bytes.len() == 4 => local = Some(bytes),
                address::Nla::Address(bytes) if bytes.len() == 4 => address = Some(bytes),
                _ => {}
            }
        }
        let bytes = local.or(address).ok_or(())?;
        Ok(AddrEntry {
            index: msg.header.index,
            addr: Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]),
            prefix_len: msg.header.prefix_len,
        })
    }
}

impl TryFrom<&RouteMessage> for RouteEntry {
    type Error = ();

    fn try_from(msg: &RouteMessage) -> Result<Self, ()> {
        if u16::from(msg.header.address_family) != AF_INET {
            return Err(());
        }
        let mut dst = None;
        let mut gateway = None;
        let mut oif = None;
        for nla in &msg.nlas {
            match nla {
                route::Nla::Destination(bytes) if bytes.len() == 4 => {
                    dst = Some(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]));
                }
                route::Nla::Gateway(bytes) if bytes.len() == 4 => {
                    gateway = Some(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]));
                }
                route::Nla::Oif(index) => oif = Some(*index),
                _ => {}
            }
        }
        Ok(RouteEntry {
            dst,
            dst_prefix_len: msg.header.destination_prefix_length,
            gateway,
            oif,
            table: msg.header.table,
            scope: msg.header.scope,
            protocol: msg.header.protocol,
        })
    }
}

/// Local replicas of the kernel link, IPv4 address and IPv4 route tables.
///
/// Entries keep kernel dump order; event-driven updates replace in place so
/// the iteration order stays stable between refills.
#[derive(Debug, Default)]
pub struct Caches {
    links: Vec<LinkEntry>,
    addrs: Vec<AddrEntry>,
    routes: Vec<RouteEntry>,
}

impl Caches {
    pub fn links(&self) -> &[LinkEntry] {
        &self.links
    }

    pub fn addrs(&self) -> &[AddrEntry] {
        &self.addrs
    }

    pub fn routes(&self) -> &[RouteEntry] {
        &self.routes
    }

    pub fn link_by_name(&self, name: &str) -> Option<&LinkEntry> {
        self.links.iter().find(|l| l.name == name)
    }

    pub fn link_by_index(&self, index: u32) -> Option<&LinkEntry> {
        self.links.iter().find(|l| l.index == index)
    }

    pub fn addrs_for(&self, index: u32) -> impl Iterator<Item = &AddrEntry> {
        self.addrs.iter().filter(move |a| a.index == index)
    }

    /// The default route whose nexthop leaves through `index`, if any.
    pub fn default_route_via(&self, index: u32) -> Option<&RouteEntry> {
        self.routes
            .iter()
            .find(|r| r.is_default() && r.oif == Some(index))
    }

    pub(crate) fn replace_links(&mut self, links: Vec<LinkEntry>) {
        self.links = links;
    }

    pub(crate) fn replace_addrs(&mut self, addrs: Vec<AddrEntry>) {
        self.addrs = addrs;
    }

    pub(crate) fn replace_routes(&mut self, routes: Vec<RouteEntry>) {
        self.routes = routes;
    }

    pub(crate) fn upsert_link(&mut self, entry: LinkEntry) {
        match self.links.iter_mut().find(|l| l.index == entry.index) {
            Some(slot) => *slot = entry,
            None => self.links.push(entry),
        }
    }

    pub(crate) fn remove_link(&mut self, index: u32) {
        self.links.retain(|l| l.index != index);
        // Addresses and routes referencing a dead link are stale too.
        self.addrs.retain(|a| a.index != index);
        self.routes.retain(|r| r.oif != Some(index));
    }

    pub(crate) fn upsert_addr(&mut self, entry: AddrEntry) {
        match self
            .addrs
            .iter_mut()
            .find(|a| a.index == entry.index && a.addr == entry.addr)
        {
            Some(slot) => *slot = entry,
            None => self.addrs.push(entry),
        }
    }

    pub(crate) fn remove_addr(&mut self, entry: &AddrEntry) {
        self.addrs
            .retain(|a| !(a.index == entry.index && a.addr == entry.addr));
    }

    pub(crate) fn upsert_route(&mut self, entry: RouteEntry) {
        match self.routes.iter_mut().find(|r| {
            r.dst == entry.dst
                && r.dst_prefix_len == entry.dst_prefix_len
                && r.table == entry.table
                && r.oif == entry.oif
        }) {
            Some(slot) => *slot = entry,
            None => self.routes.push(entry),
        }
    }

    pub(crate) fn remove_route(&mut self, entry: &RouteEntry) {
        self.routes.retain(|r| {
            !(r.dst == entry.dst
                && r.dst_prefix_len == entry.dst_prefix_len
                && r.table == entry.table
                && r.oif == entry.oif)
        });
    }
}
