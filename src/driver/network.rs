//! Host networking for micro-VM sandboxes.
//!
//! All VMs hang off one private bridge. The bridge and its NAT rule are set
//! up once per process; per-VM work is a TAP device attached to the bridge
//! and a guest IP allocated from the configured subnet. Host state mutation
//! is serialized through the manager's mutex.

use std::collections::HashSet;
use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Errors raised while mutating host network state.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("invalid subnet {0}")]
    InvalidSubnet(String),

    #[error("subnet {0} exhausted")]
    SubnetExhausted(String),

    #[error("network command failed: {0}")]
    Command(String),
}

/// Network attachment of one VM.
#[derive(Debug, Clone)]
pub struct VmNetwork {
    pub tap_name: String,
    pub guest_ip: String,
    pub gateway: String,
    pub guest_mac: String,
    pub prefix_len: u8,
}

impl VmNetwork {
    /// Dotted-quad netmask for kernel `ip=` boot arguments.
    pub fn netmask(&self) -> String {
        format_ip(prefix_mask(self.prefix_len))
    }
}

struct NetState {
    bridge_ready: bool,
    assigned: HashSet<u32>,
    cursor: u32,
}

/// Owner of the bridge, NAT rule, and guest IP allocations.
pub struct NetworkManager {
    bridge: String,
    network: u32,
    prefix_len: u8,
    subnet_cidr: String,
    state: Mutex<NetState>,
}

impl NetworkManager {
    pub fn new(bridge: impl Into<String>, subnet_cidr: &str) -> Result<Self, NetworkError> {
        let (network, prefix_len) = parse_cidr(subnet_cidr)?;
        Ok(Self {
            bridge: bridge.into(),
            network,
            prefix_len,
            subnet_cidr: subnet_cidr.to_string(),
            state: Mutex::new(NetState {
                bridge_ready: false,
                assigned: HashSet::new(),
                // First assignable address; network and gateway are skipped.
                cursor: network + 2,
            }),
        })
    }

    fn gateway_ip(&self) -> u32 {
        self.network + 1
    }

    fn broadcast_ip(&self) -> u32 {
        self.network | !prefix_mask(self.prefix_len)
    }

    /// Creates the TAP device for a sandbox, attaching it to the bridge and
    /// allocating a guest IP. The bridge itself is created on first use.
    pub async fn setup(&self, sandbox_id: &str) -> Result<VmNetwork, NetworkError> {
        let mut state = self.state.lock().await;

        if !state.bridge_ready {
            self.ensure_bridge().await?;
            state.bridge_ready = true;
        }

        let guest_ip = self.allocate_ip(&mut state)?;
        let tap_name = tap_name_for(sandbox_id);

        run_cmd("ip", &["tuntap", "add", &tap_name, "mode", "tap"]).await?;
        if let Err(e) = async {
            run_cmd("ip", &["link", "set", &tap_name, "master", &self.bridge]).await?;
            run_cmd("ip", &["link", "set", &tap_name, "up"]).await
        }
        .await
        {
            let _ = run_cmd("ip", &["link", "del", &tap_name]).await;
            state.assigned.remove(&guest_ip);
            return Err(e);
        }

        info!(
            sandbox_id = %sandbox_id,
            tap = %tap_name,
            guest_ip = %format_ip(guest_ip),
            "VM network ready"
        );

        Ok(VmNetwork {
            tap_name,
            guest_ip: format_ip(guest_ip),
            gateway: format_ip(self.gateway_ip()),
            guest_mac: mac_for_ip(guest_ip),
            prefix_len: self.prefix_len,
        })
    }

    /// Removes the TAP device and releases the guest IP. Best-effort; a
    /// partially torn-down attachment only costs one address until restart.
    pub async fn teardown(&self, net: &VmNetwork) {
        if let Err(e) = run_cmd("ip", &["link", "del", &net.tap_name]).await {
            warn!(tap = %net.tap_name, error = %e, "failed to delete TAP device");
        }
        if let Some(ip) = parse_ip(&net.guest_ip) {
            self.state.lock().await.assigned.remove(&ip);
        }
    }

    async fn ensure_bridge(&self) -> Result<(), NetworkError> {
        let gateway_cidr = format!("{}/{}", format_ip(self.gateway_ip()), self.prefix_len);

        if let Err(e) = run_cmd("ip", &["link", "add", "name", &self.bridge, "type", "bridge"]).await
        {
            // A bridge left over from a previous run is fine.
            if !e.to_string().contains("File exists") {
                return Err(e);
            }
        }
        if let Err(e) = run_cmd("ip", &["addr", "add", &gateway_cidr, "dev", &self.bridge]).await {
            if !e.to_string().contains("File exists") {
                return Err(e);
            }
        }
        run_cmd("ip", &["link", "set", &self.bridge, "up"]).await?;

        // NAT for guests that are allowed egress. Duplicated rules from a
        // prior run are tolerated; -C would race with other tools anyway.
        if let Err(e) = run_cmd(
            "iptables",
            &[
                "-t", "nat", "-A", "POSTROUTING", "-s", &self.subnet_cidr, "!", "-o",
                &self.bridge, "-j", "MASQUERADE",
            ],
        )
        .await
        {
            warn!(error = %e, "failed to install NAT rule; guests will have no egress");
        }

        info!(bridge = %self.bridge, subnet = %self.subnet_cidr, "bridge ready");
        Ok(())
    }

    fn allocate_ip(&self, state: &mut NetState) -> Result<u32, NetworkError> {
        let first = self.network + 2;
        let last = self.broadcast_ip().saturating_sub(1);
        if first > last {
            return Err(NetworkError::SubnetExhausted(self.subnet_cidr.clone()));
        }

        let span = last - first + 1;
        for _ in 0..span {
            let candidate = if state.cursor < first || state.cursor > last {
                first
            } else {
                state.cursor
            };
            state.cursor = if candidate >= last { first } else { candidate + 1 };

            if candidate == self.gateway_ip() || state.assigned.contains(&candidate) {
                continue;
            }
            state.assigned.insert(candidate);
            return Ok(candidate);
        }
        Err(NetworkError::SubnetExhausted(self.subnet_cidr.clone()))
    }
}

/// TAP names are limited to 15 chars by the kernel: "tap-" plus the first
/// 11 chars of the sandbox id.
fn tap_name_for(sandbox_id: &str) -> String {
    let suffix: String = sandbox_id.chars().filter(|c| c.is_ascii_alphanumeric()).take(11).collect();
    format!("tap-{suffix}")
}

/// Guest MAC derived from the low 16 bits of the guest IP.
fn mac_for_ip(ip: u32) -> String {
    format!("AA:FC:00:00:{:02X}:{:02X}", (ip >> 8) as u8, ip as u8)
}

fn prefix_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix_len)) }
}

fn parse_cidr(cidr: &str) -> Result<(u32, u8), NetworkError> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| NetworkError::InvalidSubnet(cidr.to_string()))?;
    let prefix_len: u8 = prefix
        .parse()
        .ok()
        .filter(|p| *p <= 30)
        .ok_or_else(|| NetworkError::InvalidSubnet(cidr.to_string()))?;
    let ip = parse_ip(addr).ok_or_else(|| NetworkError::InvalidSubnet(cidr.to_string()))?;
    Ok((ip & prefix_mask(prefix_len), prefix_len))
}

fn parse_ip(s: &str) -> Option<u32> {
    let mut octets = [0u8; 4];
    let mut parts = s.split('.');
    for octet in &mut octets {
        *octet = parts.next()?.parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(u32::from_be_bytes(octets))
}

fn format_ip(ip: u32) -> String {
    let [a, b, c, d] = ip.to_be_bytes();
    format!("{a}.{b}.{c}.{d}")
}

/// Runs an external command and returns an error if it fails.
async fn run_cmd(program: &str, args: &[&str]) -> Result<(), NetworkError> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| NetworkError::Command(format!("{} {}: {}", program, args.join(" "), e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(NetworkError::Command(format!(
            "{} {} failed ({}): {}",
            program,
            args.join(" "),
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_name_truncated_to_15_chars() {
        let name = tap_name_for("nimbus-python311-0123456789abcdef");
        assert_eq!(name, "tap-nimbuspytho");
        assert!(name.len() <= 15);
    }

    #[test]
    fn parse_cidr_normalizes_to_network_address() {
        let (net, prefix) = parse_cidr("172.30.0.17/24").unwrap();
        assert_eq!(format_ip(net), "172.30.0.0");
        assert_eq!(prefix, 24);
    }

    #[test]
    fn parse_cidr_rejects_garbage() {
        assert!(parse_cidr("not-a-subnet").is_err());
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("10.0.0/24").is_err());
    }

    #[test]
    fn mac_derived_from_ip_low_bits() {
        let ip = parse_ip("172.30.1.5").unwrap();
        assert_eq!(mac_for_ip(ip), "AA:FC:00:00:01:05");
    }

    #[test]
    fn allocator_skips_gateway_and_assigned() {
        let mgr = NetworkManager::new("nimbr0", "10.99.0.0/29").unwrap();
        let mut state = NetState {
            bridge_ready: true,
            assigned: HashSet::new(),
            cursor: mgr.network + 2,
        };
        // /29: .0 network, .1 gateway, .2-.6 assignable, .7 broadcast
        let a = mgr.allocate_ip(&mut state).unwrap();
        let b = mgr.allocate_ip(&mut state).unwrap();
        assert_eq!(format_ip(a), "10.99.0.2");
        assert_eq!(format_ip(b), "10.99.0.3");
        for _ in 0..3 {
            mgr.allocate_ip(&mut state).unwrap();
        }
        assert!(matches!(
            mgr.allocate_ip(&mut state),
            Err(NetworkError::SubnetExhausted(_))
        ));
    }

    #[test]
    fn allocator_reuses_released_addresses() {
        let mgr = NetworkManager::new("nimbr0", "10.99.0.0/30").unwrap();
        let mut state = NetState {
            bridge_ready: true,
            assigned: HashSet::new(),
            cursor: mgr.network + 2,
        };
        // /30 has exactly one assignable address (.2).
        let only = mgr.allocate_ip(&mut state).unwrap();
        assert!(mgr.allocate_ip(&mut state).is_err());
        state.assigned.remove(&only);
        assert_eq!(mgr.allocate_ip(&mut state).unwrap(), only);
    }
}
