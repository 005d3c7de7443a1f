// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Network-operations façade: the abstract operations the command router
//! dispatches to, mapped onto the route-monitor channel and the DHCP
//! supervisor. Every operation answers with a response body string; the
//! envelope is applied by the codec at the router.

use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rtnl_monitor::{CacheKind, Caches, LinkEntry, RouteMonitor, IFF_UP};
use tracing::{info, warn};

use crate::dhcp::DhcpClient;
use crate::resolv;

pub struct NetworkOps {
    monitor: Rc<RefCell<RouteMonitor>>,
    dhcp: Box<dyn DhcpClient>,
    dhcp_timeout: Duration,
}

impl NetworkOps {
    pub fn new(
        monitor: Rc<RefCell<RouteMonitor>>,
        dhcp: Box<dyn DhcpClient>,
        dhcp_timeout: Duration,
    ) -> Self {
        NetworkOps {
            monitor,
            dhcp,
            dhcp_timeout,
        }
    }

    /// One row per link, in cache order, each with all six fields.
    pub fn enumerate(&mut self) -> String {
        let monitor = self.monitor.borrow();
        let caches = monitor.caches();
        caches
            .links()
            .iter()
            .map(|link| enumeration_row(caches, link))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn enable(&mut self, ifname: &str) -> String {
        self.set_up_flag(ifname, true)
    }

    pub fn disable(&mut self, ifname: &str) -> String {
        self.set_up_flag(ifname, false)
    }

    /// Sets or clears exactly the UP bit; every other flag bit of the link is
    /// left untouched by the change mask.
    fn set_up_flag(&mut self, ifname: &str, up: bool) -> String {
        let mut monitor = self.monitor.borrow_mut();
        let Some(index) = monitor.interface_index(ifname) else {
            return "error(interface not found)".to_string();
        };
        let (set, clear) = if up { (IFF_UP, 0) } else { (0, IFF_UP) };
        match monitor.change_link_flags(index, set, clear) {
            Ok(()) if up => "success(interface enabled)".to_string(),
            Ok(()) => "success(interface disabled)".to_string(),
            Err(err) => {
                let action = if up { "enable" } else { "disable" };
                warn!("link change for {ifname} failed: {err}");
                format!("error(failed to {action} interface: {err})")
            }
        }
    }

    /// Replaces the interface's IPv4 configuration: every existing address is
    /// removed, the new one added, and (optionally) a default route set. The
    /// removal is not rolled back when a later step fails; the kernel error
    /// is reported to the client instead.
    pub fn set_static(&mut self, ifname: &str, ip: &str, prefix: &str, gateway: &str) -> String {
        if ifname.is_empty() {
            return "error(invalid arguments)".to_string();
        }
        let Ok(addr) = ip.parse::<Ipv4Addr>() else {
            return "error(invalid IP address)".to_string();
        };
        let Ok(prefix_len) = prefix.parse::<i32>() else {
            return "error(invalid prefix format)".to_string();
        };
        if !(0..=32).contains(&prefix_len) {
            return "error(invalid prefix length)".to_string();
        }
        let gateway = match gateway {
            "" | "none" => None,
            text => match text.parse::<Ipv4Addr>() {
                Ok(gw) => Some(gw),
                Err(_) => return "error(invalid gateway address)".to_string(),
            },
        };

        let mut monitor = self.monitor.borrow_mut();
        let Some(index) = monitor.interface_index(ifname) else {
            return "error(interface not found)".to_string();
        };

        if let Err(err) = monitor.submit_address_delete_all(index) {
            warn!("removing addresses on {ifname} failed: {err}");
        }
        if let Err(err) = monitor.submit_address_add(index, addr, prefix_len as u8) {
            warn!("address add on {ifname} failed: {err}");
            return format!("error(failed to set static address: {err})");
        }
        if let Some(gw) = gateway {
            if let Err(err) = monitor.submit_default_route(index, gw) {
                warn!("default route via {gw} on {ifname} failed: {err}");
                return format!("error(failed to set gateway: {err})");
            }
        }
        info!("static address {addr}/{prefix_len} set on {ifname}");
        "success(static address set)".to_string()
    }

    /// Hands the interface to the DHCP client and waits for an address.
    ///
    /// The wait polls the refreshed address cache once per second up to the
    /// configured timeout. The reactor is not served during the wait; cache
    /// observation does not depend on the event stream, so the outcome is the
    /// same either way.
    pub fn dhcp_on(&mut self, ifname: &str) -> String {
        let index = {
            let monitor = self.monitor.borrow();
            match monitor.caches().link_by_name(ifname) {
                None => return "error(interface not found)".to_string(),
                Some(link) if !link.is_up() => return "error(interface not up)".to_string(),
                Some(link) => link.index,
            }
        };

        self.dhcp.stop(ifname);
        if let Err(err) = self.dhcp.start(ifname) {
            warn!("dhcp launch for {ifname} failed: {err}");
            return format!("error({err})");
        }

        let deadline = Instant::now() + self.dhcp_timeout;
        loop {
            {
                let mut monitor = self.monitor.borrow_mut();
                if let Err(err) = monitor.refill(CacheKind::Addresses) {
                    warn!("address cache refill failed: {err}");
                } else if monitor.caches().addrs_for(index).next().is_some() {
                    // Bring links and routes up to date so the reported row
                    // carries the lease's gateway and current flags.
                    let _ = monitor.refill(CacheKind::Links);
                    let _ = monitor.refill(CacheKind::Routes);
                    let caches = monitor.caches();
                    if let Some(link) = caches.link_by_name(ifname) {
                        let row = enumeration_row(caches, link);
                        let dns = resolv::nameservers();
                        info!("dhcp lease on {ifname}: {row}; nameservers {dns:?}");
                        return row;
                    }
                }
            }
            if !self.dhcp.is_running(ifname) {
                warn!("dhcp client for {ifname} exited before an address appeared");
                return "error(dhcpcd failed)".to_string();
            }
            if Instant::now() >= deadline {
                // The client keeps trying in the background; only the wait
                // gives up here.
                return "error(dhcp timeout)".to_string();
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    /// Idempotent: stopping an interface with no tracked client is success.
    pub fn dhcp_off(&mut self, ifname: &str) -> String {
        self.dhcp.stop(ifname);
        "success(DHCP disabled)".to_string()
    }

    /// Terminates every supervised DHCP child. Called once at shutdown.
    pub fn shutdown(&mut self) {
        self.dhcp.shutdown();
    }
}

/// The six-field `key=value` row used by `enumerate` (and by the dhcp
/// acquisition reply): `iface addr mac gateway mask flag`, `none` for absent
/// fields, `mask` as the prefix length, `flag` as eight hex digits.
pub fn enumeration_row(caches: &Caches, link: &LinkEntry) -> String {
    let addr = caches.addrs_for(link.index).next();
    let gateway = caches
        .default_route_via(link.index)
        .and_then(|route| route.gateway);
    format!(
        "iface={} addr={} mac={} gateway={} mask={} flag={:08x}",
        link.name,
        addr.map(|a| a.addr.to_string())
            .unwrap_or_else(|| "none".to_string()),
        link.mac
            .map(|mac| format_mac(&mac))
            .unwrap_or_else(|| "none".to_string()),
        gateway
            .map(|gw| gw.to_string())
            .unwrap_or_else(|| "none".to_string()),
        addr.map(|a| a.prefix_len.to_string())
            .unwrap_or_else(|| "none".to_string()),
        link.flags,
    )
}

/// Lowercase, dash-separated hardware address: `aa-bb-cc-dd-ee-ff`.
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join("-")
}

/// Dotted-quad netmask for a prefix length, e.g. 24 → `255.255.255.0`.
pub fn prefix_to_netmask(prefix_len: u8) -> Ipv4Addr {
    let bits = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len.min(32)))
    };
    Ipv4Addr::from(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_formatting() {
        assert_eq!(
            format_mac(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            "aa-bb-cc-dd-ee-ff"
        );
        assert_eq!(format_mac(&[0, 1, 2, 3, 4, 5]), "00-01-02-03-04-05");
    }

    #[test]
    fn netmask_boundaries() {
        assert_eq!(prefix_to_netmask(0), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(prefix_to_netmask(8), Ipv4Addr::new(255, 0, 0, 0));
        assert_eq!(prefix_to_netmask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(prefix_to_netmask(32), Ipv4Addr::new(255, 255, 255, 255));
    }
}
