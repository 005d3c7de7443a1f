// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end command handling over a live route-monitor channel, without
//! touching kernel state: enumeration, validation failures and the DHCP
//! stop path. Tests return early in environments where a NETLINK_ROUTE
//! socket cannot be opened.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use netcfg_daemon::dhcp::StubDhcpClient;
use netcfg_daemon::netops::NetworkOps;
use netcfg_daemon::router::CommandRouter;
use rtnl_monitor::RouteMonitor;

fn router() -> Option<CommandRouter> {
    let monitor = Rc::new(RefCell::new(RouteMonitor::open().ok()?));
    let ops = NetworkOps::new(
        monitor,
        Box::<StubDhcpClient>::default(),
        Duration::from_secs(1),
    );
    Some(CommandRouter::new(ops))
}

#[test]
fn enumerate_lists_loopback() {
    let Some(router) = router() else { return };
    let response = router.dispatch(b"(enumerate)");
    assert!(response.starts_with("(enumerate("));
    assert!(response.contains("iface=lo"));
    // All six fields, on every row.
    for field in ["iface=", "addr=", "mac=", "gateway=", "mask=", "flag="] {
        assert!(response.contains(field), "missing {field} in {response}");
    }
}

#[test]
fn undecodable_frame_answers_with_error_verb() {
    let Some(router) = router() else { return };
    assert_eq!(
        router.dispatch(b"enumerate"),
        "(error(invalid S-expression format))"
    );
}

#[test]
fn unknown_verb_and_bad_arity() {
    let Some(router) = router() else { return };
    assert_eq!(
        router.dispatch(b"(reboot)"),
        "(reboot(error(unknown command or invalid arguments)))"
    );
    assert_eq!(
        router.dispatch(b"(on)"),
        "(on(error(unknown command or invalid arguments)))"
    );
    assert_eq!(
        router.dispatch(b"(on eth0 extra)"),
        "(on(error(unknown command or invalid arguments)))"
    );
    assert_eq!(
        router.dispatch(b"(enumerate extra)"),
        "(enumerate(error(unknown command or invalid arguments)))"
    );
}

#[test]
fn set_static_validation_messages() {
    let Some(router) = router() else { return };
    assert_eq!(
        router.dispatch(b"(setStatic eth0 not-an-ip 24 none)"),
        "(setStatic(error(invalid IP address)))"
    );
    assert_eq!(
        router.dispatch(b"(setStatic eth0 192.168.1.10 33 none)"),
        "(setStatic(error(invalid prefix length)))"
    );
    assert_eq!(
        router.dispatch(b"(setStatic eth0 192.168.1.10 -1 none)"),
        "(setStatic(error(invalid prefix length)))"
    );
    assert_eq!(
        router.dispatch(b"(setStatic eth0 192.168.1.10 abc none)"),
        "(setStatic(error(invalid prefix format)))"
    );
    assert_eq!(
        router.dispatch(b"(setStatic eth0 192.168.1.10 24 not-a-gw)"),
        "(setStatic(error(invalid gateway address)))"
    );
    assert_eq!(
        router.dispatch(b"(setStatic no-such-iface0 192.168.1.10 24 none)"),
        "(setStatic(error(interface not found)))"
    );
}

#[test]
fn interface_mutation_on_missing_interface() {
    let Some(router) = router() else { return };
    assert_eq!(
        router.dispatch(b"(on no-such-iface0)"),
        "(on(error(interface not found)))"
    );
    assert_eq!(
        router.dispatch(b"(off no-such-iface0)"),
        "(off(error(interface not found)))"
    );
    assert_eq!(
        router.dispatch(b"(dhcpOn no-such-iface0)"),
        "(dhcpOn(error(interface not found)))"
    );
}

#[test]
fn dhcp_off_is_idempotent() {
    let Some(router) = router() else { return };
    for _ in 0..2 {
        assert_eq!(
            router.dispatch(b"(dhcpOff eth0)"),
            "(dhcpOff(success(DHCP disabled)))"
        );
    }
}

#[test]
fn dhcp_on_loopback_reports_existing_address() {
    let Some(router) = router() else { return };
    // The stub client fabricates no lease, but loopback already has an
    // address, which is exactly what the acquisition wait looks for.
    let response = router.dispatch(b"(dhcpOn lo)");
    if response == "(dhcpOn(error(interface not up)))" {
        // Loopback is administratively down in this environment.
        return;
    }
    assert!(
        response.starts_with("(dhcpOn(iface=lo"),
        "unexpected response {response}"
    );
    assert!(response.contains("addr=127.0.0.1"));
    assert!(response.contains("mask=8"));
}
