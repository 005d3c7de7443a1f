// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Builders for the rtnetlink requests the channel submits. Flags and header
//! fields mirror what the kernel expects for each operation; sequence numbers
//! are stamped by the socket layer right before serialization.

use std::net::Ipv4Addr;

use netlink_packet_core::{NetlinkMessage, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_REQUEST};
use netlink_packet_route::constants::{
    AF_INET, RTN_UNICAST, RTPROT_STATIC, RT_SCOPE_UNIVERSE, RT_TABLE_MAIN,
};
use netlink_packet_route::nlas::{address, route};
use netlink_packet_route::{AddressMessage, LinkMessage, RouteMessage, RtnlMessage};

use crate::cache::AddrEntry;

pub(crate) fn dump_links() -> NetlinkMessage<RtnlMessage> {
    let mut msg = NetlinkMessage::from(RtnlMessage::GetLink(LinkMessage::default()));
    msg.header.flags = NLM_F_REQUEST | NLM_F_DUMP;
    msg
}

pub(crate) fn dump_addresses() -> NetlinkMessage<RtnlMessage> {
    let mut inner = AddressMessage::default();
    inner.header.family = AF_INET as u8;
    let mut msg = NetlinkMessage::from(RtnlMessage::GetAddress(inner));
    msg.header.flags = NLM_F_REQUEST | NLM_F_DUMP;
    msg
}

pub(crate) fn dump_routes() -> NetlinkMessage<RtnlMessage> {
    let mut inner = RouteMessage::default();
    inner.header.address_family = AF_INET as u8;
    let mut msg = NetlinkMessage::from(RtnlMessage::GetRoute(inner));
    msg.header.flags = NLM_F_REQUEST | NLM_F_DUMP;
    msg
}

pub(crate) fn new_address(ifindex: u32, addr: Ipv4Addr, prefix_len: u8) -> NetlinkMessage<RtnlMessage> {
    let mut inner = AddressMessage::default();
    inner.header.family = AF_INET as u8;
    inner.header.prefix_len = prefix_len;
    inner.header.index = ifindex;
    let octets = addr.octets().to_vec();
    inner.nlas.push(address::Nla::Address(octets.clone()));
    inner.nlas.push(address::Nla::Local(octets));
    let mut msg = NetlinkMessage::from(RtnlMessage::NewAddress(inner));
    msg.header.flags = NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL;
    msg
}

pub(crate) fn del_address(entry: &AddrEntry) -> NetlinkMessage<RtnlMessage> {
    let mut inner = AddressMessage::default();
    inner.header.family = AF_INET as u8;
    inner.header.prefix_len = entry.prefix_len;
    inner.header.index = entry.index;
    let octets = entry.addr.octets().to_vec();
    inner.nlas.push(address::Nla::Address(octets.clone()));
    inner.nlas.push(address::Nla::Local(octets));
    let mut msg = NetlinkMessage::from(RtnlMessage::DelAddress(inner));
    msg.header.flags = NLM_F_REQUEST | NLM_F_ACK;
    msg
}

/// Default route (`0.0.0.0/0`) through `gateway` on `ifindex`: table main,
/// scope universe, type unicast, protocol static.
pub(crate) fn default_route(ifindex: u32, gateway: Ipv4Addr) -> NetlinkMessage<RtnlMessage> {
    let mut inner = RouteMessage::default();
    inner.header.address_family = AF_INET as u8;
    inner.header.destination_prefix_length = 0;
    inner.header.table = RT_TABLE_MAIN;
    inner.header.protocol = RTPROT_STATIC;
    inner.header.scope = RT_SCOPE_UNIVERSE;
    inner.header.kind = RTN_UNICAST;
    inner.nlas.push(route::Nla::Gateway(gateway.octets().to_vec()));
    inner.nlas.push(route::Nla::Oif(ifindex));
    let mut msg = NetlinkMessage::from(RtnlMessage::NewRoute(inner));
    msg.header.flags = NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL;
    msg
}

/// Link change mutating exactly `set | clear`: bits in `set` are raised, bits
/// in `clear` are dropped, everything outside the mask is left untouched.
pub(crate) fn set_link_flags(ifindex: u32, set: u32, clear: u32) -> NetlinkMessage<RtnlMessage> {
    let mut inner = LinkMessage::default();
    inner.header.index = ifindex;
    inner.header.flags = set;
    inner.header.change_mask = set | clear;
    let mut msg = NetlinkMessage::from(RtnlMessage::SetLink(inner));
    msg.header.flags = NLM_F_REQUEST | NLM_F_ACK;
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlink_packet_core::NetlinkPayload;
    use netlink_packet_route::constants::IFF_UP;

    fn roundtrip(mut msg: NetlinkMessage<RtnlMessage>) -> NetlinkMessage<RtnlMessage> {
        msg.header.sequence_number = 1;
        msg.finalize();
        let mut buf = vec![0u8; msg.header.length as usize];
        msg.serialize(&mut buf[..]);
        NetlinkMessage::<RtnlMessage>::deserialize(&buf).unwrap()
    }

    #[test]
    fn new_address_request_shape() {
        let msg = roundtrip(new_address(2, Ipv4Addr::new(192, 168, 1, 10), 24));
        assert_eq!(
            msg.header.flags,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL
        );
        let NetlinkPayload::InnerMessage(RtnlMessage::NewAddress(inner)) = msg.payload else {
            panic!("expected RTM_NEWADDR");
        };
        assert_eq!(inner.header.index, 2);
        assert_eq!(inner.header.prefix_len, 24);
        assert_eq!(u16::from(inner.header.family), AF_INET);
        assert!(inner
            .nlas
            .iter()
            .any(|nla| matches!(nla, address::Nla::Local(b) if b == &vec![192, 168, 1, 10])));
    }

    #[test]
    fn default_route_request_shape() {
        let msg = roundtrip(default_route(2, Ipv4Addr::new(192, 168, 1, 1)));
        let NetlinkPayload::InnerMessage(RtnlMessage::NewRoute(inner)) = msg.payload else {
            panic!("expected RTM_NEWROUTE");
        };
        assert_eq!(inner.header.destination_prefix_length, 0);
        assert_eq!(inner.header.table, RT_TABLE_MAIN);
        assert_eq!(inner.header.scope, RT_SCOPE_UNIVERSE);
        assert_eq!(inner.header.kind, RTN_UNICAST);
        assert_eq!(inner.header.protocol, RTPROT_STATIC);
        assert!(inner
            .nlas
            .iter()
            .any(|nla| matches!(nla, route::Nla::Gateway(b) if b == &vec![192, 168, 1, 1])));
        assert!(inner
            .nlas
            .iter()
            .any(|nla| matches!(nla, route::Nla::Oif(2))));
    }

    #[test]
    fn set_link_flags_masks_only_requested_bits() {
        let msg = roundtrip(set_link_flags(3, 0, IFF_UP));
        let NetlinkPayload::InnerMessage(RtnlMessage::SetLink(inner)) = msg.payload else {
            panic!("expected RTM_SETLINK");
        };
        assert_eq!(inner.header.index, 3);
        assert_eq!(inner.header.flags, 0);
        assert_eq!(inner.header.change_mask, IFF_UP);
    }

    #[test]
    fn dump_requests_ask_for_dumps() {
        for msg in [dump_links(), dump_addresses(), dump_routes()] {
            assert_eq!(msg.header.flags, NLM_F_REQUEST | NLM_F_DUMP);
        }
    }
}
