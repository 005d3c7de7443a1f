// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Formats kernel events as the notification frames broadcast to every
//! client. Notifications reuse the response envelope with the verbs
//! `add_iface`/`del_iface`, `add_addr`/`del_addr`, `add_route`/`del_route`
//! and the six-field `key=value` body, `none` for absent fields.

use rtnl_monitor::{AddrEntry, AddrEvent, Caches, LinkEntry, LinkEvent, RouteEntry, RouteEvent};

use crate::netops::{format_mac, prefix_to_netmask};
use crate::sexpr;

pub fn link_frame(event: &LinkEvent) -> String {
    let (verb, entry) = match event {
        LinkEvent::New(entry) => ("add_iface", entry),
        LinkEvent::Del(entry) => ("del_iface", entry),
    };
    sexpr::encode(verb, &link_body(entry))
}

pub fn addr_frame(caches: &Caches, event: &AddrEvent) -> String {
    let (verb, entry) = match event {
        AddrEvent::New(entry) => ("add_addr", entry),
        AddrEvent::Del(entry) => ("del_addr", entry),
    };
    sexpr::encode(verb, &addr_body(caches, entry))
}

pub fn route_frame(event: &RouteEvent) -> String {
    let (verb, entry) = match event {
        RouteEvent::New(entry) => ("add_route", entry),
        RouteEvent::Del(entry) => ("del_route", entry),
    };
    sexpr::encode(verb, &route_body(entry))
}

fn link_body(entry: &LinkEntry) -> String {
    format!(
        "iface={} addr=none mac={} gateway=none mask=none flag={:08x}",
        entry.name,
        entry
            .mac
            .map(|mac| format_mac(&mac))
            .unwrap_or_else(|| "none".to_string()),
        entry.flags,
    )
}

fn addr_body(caches: &Caches, entry: &AddrEntry) -> String {
    let ifname = caches
        .link_by_index(entry.index)
        .map(|link| link.name.clone())
        .unwrap_or_else(|| format!("unknown-{}", entry.index));
    format!(
        "iface={ifname} addr={} mac=none gateway=none mask={} flag=none",
        entry.addr,
        prefix_to_netmask(entry.prefix_len),
    )
}

fn route_body(entry: &RouteEntry) -> String {
    // `route0` is a fixed placeholder, not the output interface name.
    let destination = if entry.is_default() {
        "default".to_string()
    } else {
        match entry.dst {
            Some(dst) => format!("{dst}/{}", entry.dst_prefix_len),
            None => "none".to_string(),
        }
    };
    format!(
        "iface=route0 addr={destination} mac=none gateway={} mask=none flag=none",
        entry
            .gateway
            .map(|gw| gw.to_string())
            .unwrap_or_else(|| "none".to_string()),
    )
}
