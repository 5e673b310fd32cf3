//! Default gateway lookup and its time-bounded cache.

use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::process::Command;

use super::ProbeError;

/// Address probed when the routing table yields nothing usable.
pub const FALLBACK_GATEWAY: &str = "192.168.1.1";

/// How long a detected gateway stays valid.
pub const GATEWAY_CACHE_TTL: Duration = Duration::from_secs(300);

const ROUTE_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Cached gateway address plus the moment it was fetched.
#[derive(Debug)]
pub struct GatewayCache {
    entry: Option<(String, Instant)>,
    ttl: Duration,
}

impl Default for GatewayCache {
    fn default() -> Self {
        Self::new(GATEWAY_CACHE_TTL)
    }
}

impl GatewayCache {
    pub fn new(ttl: Duration) -> Self {
        Self { entry: None, ttl }
    }

    /// The cached address if it was fetched less than `ttl` before `now`.
    pub fn get(&self, now: Instant) -> Option<&str> {
        match &self.entry {
            Some((addr, fetched)) if now.saturating_duration_since(*fetched) < self.ttl => Some(addr.as_str()),
            _ => None,
        }
    }

    pub fn store(&mut self, addr: String, now: Instant) {
        self.entry = Some((addr, now));
    }

    /// Merge a detection attempt into the cache and return the address to probe.
    ///
    /// A failed attempt leaves a still-fresh entry in place; with nothing
    /// fresh cached the fallback address is used.
    pub fn resolve(&mut self, detected: Result<String, ProbeError>, now: Instant) -> String {
        match detected {
            Ok(addr) => {
                tracing::info!("Gateway detected: {}", addr);
                self.store(addr.clone(), now);
                addr
            }
            Err(e) => {
                if let Some(addr) = self.get(now) {
                    return addr.to_string();
                }
                tracing::warn!("Gateway not detected ({}), using fallback {}", e, FALLBACK_GATEWAY);
                FALLBACK_GATEWAY.to_string()
            }
        }
    }
}

/// Query the OS routing table for the default IPv4 gateway.
pub async fn detect_default_gateway() -> Result<String, ProbeError> {
    let (program, args): (&str, &[&str]) = if cfg!(target_os = "macos") {
        ("route", &["-n", "get", "default"][..])
    } else if cfg!(windows) {
        ("route", &["print", "0.0.0.0"][..])
    } else {
        ("ip", &["route", "show", "default"][..])
    };

    let child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(ROUTE_COMMAND_TIMEOUT, child)
        .await
        .map_err(|_| ProbeError::Timeout)?
        .map_err(|e| ProbeError::Command(format!("failed to execute {}: {}", program, e)))?;

    if !output.status.success() {
        return Err(ProbeError::Command(format!(
            "{} exited with {}",
            program, output.status
        )));
    }

    parse_default_gateway(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| ProbeError::Command("no default route found".to_string()))
}

/// Extract the gateway from `ip route`, `route -n get` or `route print` output.
fn parse_default_gateway(output: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"(?m)(?:^default via\s+|gateway:\s+|^\s*0\.0\.0\.0\s+0\.0\.0\.0\s+)(?P<gw>[0-9.]+)")
            .expect("valid gateway regex")
    });

    re.captures_iter(output)
        .filter_map(|c| c.name("gw").map(|m| m.as_str()))
        .find(|gw| gw.parse::<Ipv4Addr>().is_ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_linux_route() {
        let out = "default via 10.0.0.1 dev eth0 proto dhcp metric 100\n";
        assert_eq!(parse_default_gateway(out).as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_parse_macos_route() {
        let out = "   route to: default\ndestination: default\n       mask: default\n    gateway: 192.168.0.254\n  interface: en0\n";
        assert_eq!(parse_default_gateway(out).as_deref(), Some("192.168.0.254"));
    }

    #[test]
    fn test_parse_windows_route() {
        let out = "Network Destination        Netmask          Gateway       Interface  Metric\n          0.0.0.0          0.0.0.0      172.16.0.1    172.16.0.20     25\n";
        assert_eq!(parse_default_gateway(out).as_deref(), Some("172.16.0.1"));
    }

    #[test]
    fn test_parse_no_default_route() {
        assert!(parse_default_gateway("10.0.0.0/24 dev eth0 scope link\n").is_none());
    }

    #[test]
    fn test_cache_expires_after_ttl() {
        let start = Instant::now();
        let mut cache = GatewayCache::new(Duration::from_secs(300));
        cache.store("10.0.0.1".to_string(), start);

        assert_eq!(cache.get(start + Duration::from_secs(299)), Some("10.0.0.1"));
        assert_eq!(cache.get(start + Duration::from_secs(300)), None);
    }

    #[test]
    fn test_failed_fetch_keeps_fresh_value() {
        let start = Instant::now();
        let mut cache = GatewayCache::new(Duration::from_secs(300));
        cache.store("10.0.0.1".to_string(), start);

        let addr = cache.resolve(
            Err(ProbeError::Command("boom".into())),
            start + Duration::from_secs(10),
        );
        assert_eq!(addr, "10.0.0.1");
        assert_eq!(cache.get(start + Duration::from_secs(10)), Some("10.0.0.1"));
    }

    #[test]
    fn test_failed_fetch_without_cache_falls_back() {
        let mut cache = GatewayCache::default();
        let addr = cache.resolve(Err(ProbeError::Command("boom".into())), Instant::now());
        assert_eq!(addr, FALLBACK_GATEWAY);
        assert!(cache.get(Instant::now()).is_none());
    }
}
