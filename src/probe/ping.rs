//! ICMP echo probe with a `ping` command fallback.
//!
//! Native sockets run in `spawn_blocking` so the round-trip is timed on a
//! dedicated thread.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn next_echo_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket)");
        return IcmpCapability::Native;
    }

    // Unprivileged ICMP on Linux with ping_group_range, and on macOS.
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using ping command");
    IcmpCapability::CommandOnly
}

/// Ping `address` once and return the round-trip time in nanoseconds.
pub async fn run_ping_probe(address: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::CommandOnly {
        return run_ping_command(address, timeout).await;
    }

    let ip = resolve_address(address).await?;
    let result = tokio::task::spawn_blocking(move || blocking_echo(ip, timeout))
        .await
        .map_err(|e| ProbeError::Network(format!("ping task failed: {}", e)))?;

    match result {
        Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
            tracing::warn!(
                "Native ping not permitted for {}, falling back to command: {}",
                address,
                msg
            );
            run_ping_command(address, timeout).await
        }
        other => other,
    }
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("Operation not permitted") || msg.contains("denied")
}

/// Resolve a hostname or IP literal to a single address.
pub async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host((address, 0))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", address)))
}

fn blocking_echo(ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let (domain, protocol, request_type, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, ICMP_ECHO_REQUEST, ICMP_ECHO_REPLY),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, ICMPV6_ECHO_REQUEST, ICMPV6_ECHO_REPLY),
    };

    let socket = Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
        .map_err(|e| ProbeError::Network(format!("failed to create ICMP socket: {}", e)))?;

    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let (identifier, sequence) = next_echo_id();
    let packet = build_echo_request(request_type, identifier, sequence);

    let start = Instant::now();
    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("failed to send: {}", e))
        }
    })?;

    loop {
        let mut buf: [MaybeUninit<u8>; 1500] = [MaybeUninit::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => ProbeError::Timeout,
            _ => ProbeError::Network(format!("failed to receive: {}", e)),
        })?;
        // SAFETY: recv initialized the first `len` bytes.
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };
        let elapsed = start.elapsed();

        if elapsed >= timeout {
            return Err(ProbeError::Timeout);
        }

        if is_matching_reply(buf, reply_type, identifier, sequence) {
            return Ok(elapsed.as_nanos() as f64);
        }
    }
}

/// Check whether `buf` holds the echo reply for our request.
///
/// RAW IPv4 sockets deliver the IP header in front of the ICMP message.
fn is_matching_reply(buf: &[u8], reply_type: u8, identifier: u16, sequence: u16) -> bool {
    let offset = if reply_type == ICMP_ECHO_REPLY && !buf.is_empty() && buf[0] >> 4 == 4 {
        usize::from(buf[0] & 0x0F) * 4
    } else {
        0
    };
    if buf.len() < offset + 8 {
        return false;
    }

    let icmp = &buf[offset..];
    icmp[0] == reply_type
        && u16::from_be_bytes([icmp[4], icmp[5]]) == identifier
        && u16::from_be_bytes([icmp[6], icmp[7]]) == sequence
}

fn build_echo_request(icmp_type: u8, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];
    packet[0] = icmp_type;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    packet[8..16].copy_from_slice(&stamp.to_be_bytes());

    // The kernel fills in the ICMPv6 checksum.
    if icmp_type == ICMP_ECHO_REQUEST {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Internet checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Single-echo `ping` arguments; Windows takes milliseconds, Unix seconds.
fn ping_args(windows: bool, address: &str, timeout: Duration) -> Vec<String> {
    let (count, wait, value) = if windows {
        ("-n", "-w", timeout.as_millis().max(1).to_string())
    } else {
        ("-c", "-W", timeout.as_secs().max(1).to_string())
    };
    vec![count.to_string(), "1".to_string(), wait.to_string(), value, address.to_string()]
}

async fn run_ping_command(address: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let args = ping_args(cfg!(windows), address, timeout);

    let output = Command::new("ping")
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("timeout") || stdout.contains("100% packet loss") || stdout.contains("100.0% packet loss") {
            return Err(ProbeError::Timeout);
        }
        let detail = if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() };
        return Err(ProbeError::Command(format!("host unreachable: {}", detail)));
    }

    parse_ping_output(&stdout)
}

/// Extract the round-trip time in nanoseconds from `ping` output.
fn parse_ping_output(output: &str) -> Result<f64, ProbeError> {
    static PER_PACKET: OnceLock<Regex> = OnceLock::new();
    static SUMMARY: OnceLock<Regex> = OnceLock::new();

    let per_packet = PER_PACKET.get_or_init(|| {
        Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").expect("valid per-packet regex")
    });
    if let Some(ms) = per_packet
        .captures(output)
        .and_then(|c| c.name("val"))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        return Ok(ms * 1_000_000.0);
    }

    // "round-trip min/avg/max/stddev" (macOS) or "rtt min/avg/max/mdev" (Linux)
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:round-trip|rtt)\s+min/avg/max/(?:stddev|mdev)\s*=\s*[0-9.]+/(?P<avg>[0-9.]+)/")
            .expect("valid summary regex")
    });
    if let Some(ms) = summary
        .captures(output)
        .and_then(|c| c.name("avg"))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        return Ok(ms * 1_000_000.0);
    }

    Err(ProbeError::Command(format!("failed to parse ping output: {}", output.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_args_follow_configured_timeout() {
        let timeout = Duration::from_secs(3);
        assert_eq!(ping_args(true, "192.0.2.1", timeout), vec!["-n", "1", "-w", "3000", "192.0.2.1"]);
        assert_eq!(ping_args(false, "192.0.2.1", timeout), vec!["-c", "1", "-W", "3", "192.0.2.1"]);
        assert_eq!(ping_args(false, "192.0.2.1", Duration::from_millis(200))[3], "1");
    }

    #[test]
    fn test_checksum_validates_to_zero() {
        let packet = build_echo_request(ICMP_ECHO_REQUEST, 0x1234, 7);
        // A packet including its own checksum sums to 0xFFFF, so the complement is 0.
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_build_echo_request_layout() {
        let packet = build_echo_request(ICMP_ECHO_REQUEST, 0x1234, 0x0001);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        assert_eq!(packet[4..6], [0x12, 0x34]);
        assert_eq!(packet[6..8], [0x00, 0x01]);
    }

    #[test]
    fn test_matching_reply_skips_ipv4_header() {
        let mut reply = vec![0u8; 28];
        reply[0] = 0x45;
        reply[20] = ICMP_ECHO_REPLY;
        reply[24..26].copy_from_slice(&0xBEEFu16.to_be_bytes());
        reply[26..28].copy_from_slice(&3u16.to_be_bytes());

        assert!(is_matching_reply(&reply, ICMP_ECHO_REPLY, 0xBEEF, 3));
        assert!(!is_matching_reply(&reply, ICMP_ECHO_REPLY, 0xBEEF, 4));
        assert!(!is_matching_reply(&reply[..10], ICMP_ECHO_REPLY, 0xBEEF, 3));
    }

    #[test]
    fn test_matching_reply_dgram_v6() {
        let mut reply = vec![0u8; 8];
        reply[0] = ICMPV6_ECHO_REPLY;
        reply[4..6].copy_from_slice(&9u16.to_be_bytes());
        reply[6..8].copy_from_slice(&1u16.to_be_bytes());
        assert!(is_matching_reply(&reply, ICMPV6_ECHO_REPLY, 9, 1));
    }

    #[test]
    fn test_parse_ping_output_linux() {
        let output = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.345 ms";
        let latency = parse_ping_output(output).unwrap();
        assert!((latency - 12_345_000.0).abs() < 1.0);
    }

    #[test]
    fn test_parse_ping_output_macos_summary() {
        let output = r#"PING google.com (142.250.69.174): 56 data bytes

--- google.com ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/17.906/17.906/0.000 ms"#;
        let latency = parse_ping_output(output).unwrap();
        assert!((latency - 17_906_000.0).abs() < 1.0);
    }

    #[test]
    fn test_parse_ping_output_garbage() {
        assert!(parse_ping_output("Request timed out.").is_err());
    }

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let ip = resolve_address("203.0.113.9").await.unwrap();
        assert_eq!(ip.to_string(), "203.0.113.9");
    }
}
