// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

const ENV_SOCKET_PATH: &str = "NETCFGD_SOCKET_PATH";
const ENV_DHCP_LOG_PATH: &str = "NETCFGD_DHCP_LOG_PATH";
const ENV_DHCP_CLIENT: &str = "NETCFGD_DHCP_CLIENT";
const ENV_DHCP_TIMEOUT_SECS: &str = "NETCFGD_DHCP_TIMEOUT_SECS";
const ENV_LOG_LEVEL: &str = "NETCFGD_LOG";

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/network_daemon.sock";
const DEFAULT_DHCP_LOG_PATH: &str = "/tmp/dhcpcd.log";
const DEFAULT_DHCP_CLIENT: &str = "dhcpcd";
const DEFAULT_DHCP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_LOG_LEVEL: &str = "info";

/// Daemon configuration. Everything that was a process-wide constant in
/// earlier incarnations (socket path, DHCP client log path) is an input here
/// and flows to the components at construction.
#[derive(Debug, Clone)]
pub struct Config {
    pub socket_path: PathBuf,
    pub dhcp_log_path: PathBuf,
    /// DHCP client binary, resolved through `PATH`.
    pub dhcp_client: String,
    /// How long `dhcpOn` waits for an address before giving up.
    pub dhcp_timeout: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            dhcp_log_path: PathBuf::from(DEFAULT_DHCP_LOG_PATH),
            dhcp_client: DEFAULT_DHCP_CLIENT.to_string(),
            dhcp_timeout: DEFAULT_DHCP_TIMEOUT,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        FromEnv::config()
    }
}

pub struct FromEnv {}

impl FromEnv {
    fn socket_path() -> PathBuf {
        std::env::var_os(ENV_SOCKET_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
    }

    fn dhcp_log_path() -> PathBuf {
        std::env::var_os(ENV_DHCP_LOG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DHCP_LOG_PATH))
    }

    fn dhcp_client() -> String {
        std::env::var(ENV_DHCP_CLIENT).unwrap_or_else(|_| DEFAULT_DHCP_CLIENT.to_string())
    }

    fn dhcp_timeout() -> Duration {
        std::env::var(ENV_DHCP_TIMEOUT_SECS)
            .unwrap_or_default()
            .parse()
            .ok()
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_DHCP_TIMEOUT)
    }

    fn log_level() -> String {
        std::env::var(ENV_LOG_LEVEL).unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string())
    }

    pub fn config() -> Config {
        Config {
            socket_path: Self::socket_path(),
            dhcp_log_path: Self::dhcp_log_path(),
            dhcp_client: Self::dhcp_client(),
            dhcp_timeout: Self::dhcp_timeout(),
            log_level: Self::log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.dhcp_client, "dhcpcd");
        assert_eq!(config.dhcp_timeout, Duration::from_secs(30));
    }

    #[test]
    fn timeout_from_env_falls_back_on_garbage() {
        std::env::set_var(ENV_DHCP_TIMEOUT_SECS, "not-a-number");
        assert_eq!(FromEnv::dhcp_timeout(), DEFAULT_DHCP_TIMEOUT);
        std::env::set_var(ENV_DHCP_TIMEOUT_SECS, "5");
        assert_eq!(FromEnv::dhcp_timeout(), Duration::from_secs(5));
        std::env::remove_var(ENV_DHCP_TIMEOUT_SECS);
    }
}
