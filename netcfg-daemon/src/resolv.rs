// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reads the host's name-resolver configuration. Display-only: the daemon
//! never manages DNS, it just reports what the resolver file says.

use std::net::Ipv4Addr;
use std::path::Path;

pub const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

pub fn nameservers() -> Vec<Ipv4Addr> {
    nameservers_from(Path::new(RESOLV_CONF_PATH))
}

/// Scans `path` line by line for `nameserver <ipv4>` entries. Unreadable
/// files and non-IPv4 entries are skipped.
pub fn nameservers_from(path: &Path) -> Vec<Ipv4Addr> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    contents
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix("nameserver"))
        .filter_map(|rest| rest.trim().parse::<Ipv4Addr>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_nameserver_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# resolv.conf").unwrap();
        writeln!(file, "search example.com").unwrap();
        writeln!(file, "nameserver 8.8.8.8").unwrap();
        writeln!(file, "nameserver 2001:4860:4860::8888").unwrap();
        writeln!(file, "nameserver 1.1.1.1").unwrap();
        let servers = nameservers_from(file.path());
        assert_eq!(
            servers,
            [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)]
        );
    }

    #[test]
    fn missing_file_yields_nothing() {
        assert!(nameservers_from(Path::new("/nonexistent/resolv.conf")).is_empty());
    }
}
