use anyhow::{Context, Result, bail};
use log::{debug, warn};
#[cfg(feature = "mock")]
use mockall::automock;
use std::net::Ipv4Addr;
use tokio::process::Command;
use trait_variant::make;

const ROUTE_TABLE_PATH: &str = "/proc/net/route";

const RTF_UP: u16 = 0x0001;
const RTF_GATEWAY: u16 = 0x0002;

/// Imperative interface to the host's Wi-Fi subsystem.
///
/// `join` may take tens of seconds to complete; callers own sequencing and
/// timeouts.
#[make(Send)]
#[cfg_attr(feature = "mock", automock)]
pub trait WifiLink {
    /// Switch the Wi-Fi radio on. Idempotent; reports whether the radio is
    /// active after the call.
    async fn enable(&self) -> Result<bool>;

    /// SSID of the currently associated network, if any.
    async fn current_ssid(&self) -> Result<Option<String>>;

    /// Default-route gateway of the current association. `None` when the
    /// host is not associated or holds no lease.
    async fn current_gateway(&self) -> Result<Option<Ipv4Addr>>;

    /// Associate with `ssid`. An empty password means an open network.
    async fn join(&self, ssid: &str, password: &str) -> Result<()>;
}

/// `WifiLink` backed by NetworkManager's `nmcli` frontend.
pub struct NmcliWifiLink {
    interface: Option<String>,
}

impl NmcliWifiLink {
    pub fn new(interface: Option<String>) -> Self {
        Self { interface }
    }

    async fn nmcli(args: &[&str]) -> Result<String> {
        debug!("nmcli {}", args.join(" "));

        let output = Command::new("nmcli")
            .args(args)
            .output()
            .await
            .context("failed to run nmcli")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("nmcli {} failed: {}", args.join(" "), stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn connect(&self, ssid: &str, password: &str) -> Result<()> {
        let mut args = vec!["dev", "wifi", "connect", ssid];

        if !password.is_empty() {
            args.extend(["password", password]);
        }

        if let Some(interface) = &self.interface {
            args.extend(["ifname", interface.as_str()]);
        }

        Self::nmcli(&args).await.map(|_| ())
    }
}

impl WifiLink for NmcliWifiLink {
    async fn enable(&self) -> Result<bool> {
        Self::nmcli(&["radio", "wifi", "on"]).await?;

        let state = Self::nmcli(&["radio", "wifi"]).await?;
        Ok(state.trim() == "enabled")
    }

    async fn current_ssid(&self) -> Result<Option<String>> {
        let output = Self::nmcli(&["-t", "-f", "active,ssid", "dev", "wifi"]).await?;
        Ok(active_ssid(&output))
    }

    async fn current_gateway(&self) -> Result<Option<Ipv4Addr>> {
        let table = tokio::fs::read_to_string(ROUTE_TABLE_PATH)
            .await
            .context("failed to read routing table")?;
        Ok(default_gateway(&table))
    }

    async fn join(&self, ssid: &str, password: &str) -> Result<()> {
        match self.connect(ssid, password).await {
            Ok(()) => Ok(()),
            Err(e) if is_authorization_failure(&format!("{e:#}")) => {
                // Some hosts drop the network-control capability mid-session;
                // re-request it once and retry.
                warn!("network control authorization lost, re-requesting: {e:#}");
                self.enable()
                    .await
                    .context("failed to re-enable Wi-Fi radio")?;
                self.connect(ssid, password).await
            }
            Err(e) => Err(e),
        }
    }
}

/// Derive the gateway address from the raw little-endian word of a routing
/// table entry or DHCP lease. The word carries the address in host byte
/// order and has to be byte-swapped before formatting as a dotted quad.
fn gateway_from_raw(raw: u32) -> Ipv4Addr {
    Ipv4Addr::from(raw.swap_bytes())
}

/// Default-route gateway from `/proc/net/route` contents. Each address field
/// is one hex word in host (little-endian) byte order; the default route has
/// destination `00000000`.
fn default_gateway(table: &str) -> Option<Ipv4Addr> {
    for line in table.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let (Some(_iface), Some(destination), Some(gateway), Some(flags)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };

        let Ok(flags) = u16::from_str_radix(flags, 16) else {
            continue;
        };

        if destination != "00000000" || flags & (RTF_UP | RTF_GATEWAY) != (RTF_UP | RTF_GATEWAY) {
            continue;
        }

        if let Ok(raw) = u32::from_str_radix(gateway, 16) {
            return Some(gateway_from_raw(raw));
        }
    }

    None
}

/// First active SSID in `nmcli -t -f active,ssid dev wifi` output. Terse
/// mode escapes colons inside field values.
fn active_ssid(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("yes:"))
        .map(|ssid| ssid.replace("\\:", ":"))
        .filter(|ssid| !ssid.is_empty())
}

fn is_authorization_failure(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("not authorized") || message.contains("insufficient privileges")
}
