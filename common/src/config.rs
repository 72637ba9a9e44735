use crate::error::{GridError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Membership configuration, consumed by members and locators
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Locator list: `host[port],host[port]` or `host:port,host:port`
    pub locators: String,

    /// Address the membership and locator sockets bind to
    pub bind_address: IpAddr,

    /// Membership listener port (0 picks an ephemeral port)
    pub member_port: u16,

    /// Time a peer may stay silent before it is suspected (milliseconds)
    pub member_timeout_ms: u64,

    /// Silence of `crash_multiplier × member_timeout` declares a crash
    pub crash_multiplier: u32,

    /// Ring successors watched in addition to the coordinator
    pub monitor_neighbors: usize,

    /// Bound on joining the cluster (milliseconds)
    pub join_timeout_ms: u64,

    /// How long a coordinator waits for view acks (0 means member timeout)
    pub view_ack_timeout_ms: u64,

    /// Fraction of members that must ack before a view counts as committed
    pub ack_quorum_fraction: f64,

    pub enable_network_partition_detection: bool,

    pub disable_auto_reconnect: bool,

    pub max_reconnect_attempts: u32,

    pub reconnect_wait_ms: u64,

    pub locators_preferred_as_coordinators: bool,

    /// Percentage of prior-view weight that must survive
    pub loss_threshold_percent: u8,

    /// Crashes within this window count as one partition event (milliseconds)
    pub loss_correlation_window_ms: u64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            locators: String::new(),
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            member_port: 0,
            member_timeout_ms: 5000,
            crash_multiplier: 3,
            monitor_neighbors: 1,
            join_timeout_ms: 17000,
            view_ack_timeout_ms: 0,
            ack_quorum_fraction: 0.51,
            enable_network_partition_detection: true,
            disable_auto_reconnect: false,
            max_reconnect_attempts: 3,
            reconnect_wait_ms: 5000,
            locators_preferred_as_coordinators: true,
            loss_threshold_percent: 51,
            loss_correlation_window_ms: 10000,
        }
    }
}

impl MembershipConfig {
    /// Configuration pointing at the given locator list, defaults elsewhere
    pub fn with_locators(locators: impl Into<String>) -> Self {
        Self {
            locators: locators.into(),
            ..Self::default()
        }
    }

    pub fn member_timeout(&self) -> Duration {
        Duration::from_millis(self.member_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn view_ack_timeout(&self) -> Duration {
        if self.view_ack_timeout_ms == 0 {
            self.member_timeout()
        } else {
            Duration::from_millis(self.view_ack_timeout_ms)
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        (self.member_timeout() / 4).max(Duration::from_millis(10))
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }

    pub fn loss_correlation_window(&self) -> Duration {
        Duration::from_millis(self.loss_correlation_window_ms)
    }

    /// Check every field and resolve the locator list
    pub fn validate(&self) -> Result<Vec<SocketAddr>> {
        self.validate_settings()?;
        self.locator_endpoints()
    }

    /// Check the timing and quorum settings, leaving the locator list alone
    pub fn validate_settings(&self) -> Result<()> {
        if self.member_timeout_ms == 0 {
            return Err(GridError::Config("member-timeout must be positive".to_string()));
        }
        if self.join_timeout_ms == 0 {
            return Err(GridError::Config("join-timeout must be positive".to_string()));
        }
        if self.crash_multiplier == 0 {
            return Err(GridError::Config("crash multiplier must be positive".to_string()));
        }
        if self.loss_threshold_percent > 100 {
            return Err(GridError::Config(format!(
                "loss threshold {}% exceeds 100%",
                self.loss_threshold_percent
            )));
        }
        if !(self.ack_quorum_fraction > 0.0 && self.ack_quorum_fraction <= 1.0) {
            return Err(GridError::Config(format!(
                "ack quorum fraction {} is outside (0, 1]",
                self.ack_quorum_fraction
            )));
        }

        Ok(())
    }

    /// Parse and resolve the locator list
    pub fn locator_endpoints(&self) -> Result<Vec<SocketAddr>> {
        let endpoints = parse_locators(&self.locators)?;
        if endpoints.is_empty() {
            return Err(GridError::Config(
                "no locators configured; set `locators` to host[port],...".to_string(),
            ));
        }
        Ok(endpoints)
    }
}

/// Parse a locator list such as `host1[10334],host2[10335]` or
/// `10.0.0.1:10334`. Blank entries are ignored.
pub fn parse_locators(list: &str) -> Result<Vec<SocketAddr>> {
    let mut endpoints = Vec::new();

    for raw in list.split(',') {
        let entry = raw.trim();
        if entry.is_empty() {
            continue;
        }

        let (host, port) = split_host_port(entry)?;
        let resolved = (host, port)
            .to_socket_addrs()
            .map_err(|e| {
                GridError::Config(format!("unable to resolve locator '{}': {}", entry, e))
            })?
            .min_by_key(|addr| !addr.is_ipv4())
            .ok_or_else(|| GridError::Config(format!("locator '{}' resolved to nothing", entry)))?;

        if !endpoints.contains(&resolved) {
            endpoints.push(resolved);
        }
    }

    Ok(endpoints)
}

fn split_host_port(entry: &str) -> Result<(&str, u16)> {
    let (host, port) = if let Some(open) = entry.find('[') {
        let close = entry
            .rfind(']')
            .filter(|close| *close > open && *close == entry.len() - 1)
            .ok_or_else(|| GridError::Config(format!("malformed locator '{}'", entry)))?;
        (&entry[..open], &entry[open + 1..close])
    } else {
        entry
            .rsplit_once(':')
            .ok_or_else(|| GridError::Config(format!("locator '{}' has no port", entry)))?
    };

    let host = host.trim();
    if host.is_empty() {
        return Err(GridError::Config(format!("locator '{}' has no host", entry)));
    }

    let port: u16 = port
        .trim()
        .parse()
        .map_err(|_| GridError::Config(format!("locator '{}' has an invalid port", entry)))?;
    if port == 0 {
        return Err(GridError::Config(format!("locator '{}' uses port 0", entry)));
    }

    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bracket_and_colon_forms() {
        let endpoints = parse_locators("127.0.0.1[10334], 127.0.0.1:10335").unwrap();
        assert_eq!(
            endpoints,
            vec![
                "127.0.0.1:10334".parse::<SocketAddr>().unwrap(),
                "127.0.0.1:10335".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn test_duplicates_and_blanks_are_dropped() {
        let endpoints = parse_locators("127.0.0.1[10334],,127.0.0.1[10334]").unwrap();
        assert_eq!(endpoints.len(), 1);
    }

    #[test]
    fn test_malformed_locators_are_config_errors() {
        for bad in ["127.0.0.1[abc]", "127.0.0.1[10334", "[10334]", "127.0.0.1", "127.0.0.1[0]"] {
            let err = parse_locators(bad).unwrap_err();
            assert!(matches!(err, GridError::Config(_)), "{} gave {:?}", bad, err);
        }
    }

    #[test]
    fn test_validate_rejects_missing_locators() {
        let config = MembershipConfig::default();
        assert!(matches!(config.validate(), Err(GridError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_fractions() {
        let mut config = MembershipConfig::with_locators("127.0.0.1[10334]");
        assert!(config.validate().is_ok());

        config.ack_quorum_fraction = 0.0;
        assert!(config.validate().is_err());

        config.ack_quorum_fraction = 1.0;
        config.loss_threshold_percent = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_view_ack_timeout_defaults_to_member_timeout() {
        let mut config = MembershipConfig::default();
        config.member_timeout_ms = 2000;
        assert_eq!(config.view_ack_timeout(), Duration::from_millis(2000));
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(500));

        config.view_ack_timeout_ms = 700;
        assert_eq!(config.view_ack_timeout(), Duration::from_millis(700));
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: MembershipConfig = serde_json::from_str(
            r#"{"locators": "127.0.0.1[10334]", "member_timeout_ms": 2000,
                "enable_network_partition_detection": false}"#,
        )
        .unwrap();

        assert_eq!(config.member_timeout_ms, 2000);
        assert!(!config.enable_network_partition_detection);
        assert_eq!(config.crash_multiplier, 3);
    }
}
