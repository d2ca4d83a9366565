//! Host facade: identity discovery, memory locking, service-manager probes.

use crate::error::KeywardenResult;
use log::warn;
use std::fs;
use std::net::UdpSocket;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Best-effort hostname and outward-facing IP address of this host.
///
/// The IP is discovered by opening (not sending on) a UDP socket towards a
/// public address and reading the chosen local endpoint. Falls back to
/// loopback values when the host is isolated.
pub fn hostname_and_ip() -> (String, String) {
    let hostname = fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|raw| raw.trim().to_string())
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string());

    let ip = UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("192.0.2.1:3737")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string());

    (hostname, ip)
}

/// Lock the process address space against paging so key material never hits
/// swap. Failure (for example, missing CAP_IPC_LOCK) is logged, not fatal.
pub fn lock_process_memory() {
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if rc != 0 {
        warn!(
            "unable to lock process memory against swapping: {}",
            std::io::Error::last_os_error()
        );
    }
}

/// Whether a systemd unit is currently active. Probe failures count as "not
/// running".
pub fn systemctl_is_running(unit: &str) -> bool {
    Command::new("systemctl")
        .args(["is-active", "--quiet", unit])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Enable and restart a systemd unit.
pub fn systemctl_enable_restart(unit: &str) -> KeywardenResult<()> {
    for action in ["enable", "restart"] {
        let status = Command::new("systemctl").args([action, unit]).status()?;
        if !status.success() {
            return Err(crate::error::KeywardenError::Io(std::io::Error::other(
                format!("systemctl {action} {unit} exited with {status}"),
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_now_is_recent() {
        // Anything after 2020-01-01 is plausible for a live clock.
        assert!(unix_now() > 1_577_836_800);
    }

    #[test]
    fn hostname_and_ip_always_yield_values() {
        let (hostname, ip) = hostname_and_ip();
        assert!(!hostname.is_empty());
        assert!(ip.parse::<std::net::IpAddr>().is_ok());
    }
}
