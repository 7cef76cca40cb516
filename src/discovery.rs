use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent};
#[cfg(feature = "mock")]
use mockall::automock;
use std::{
    net::IpAddr,
    time::{Duration, SystemTime},
};
use tokio::time::{Instant, timeout};
use trait_variant::make;

/// A service instance resolved on the currently joined network.
#[derive(Clone, Debug)]
pub struct DiscoveryResult {
    pub service_name: String,
    pub address: IpAddr,
    pub resolved_at: SystemTime,
}

/// Multicast-DNS browser for the node's advertised service.
#[make(Send)]
#[cfg_attr(feature = "mock", automock)]
pub trait ServiceDiscovery {
    /// Browse for `service_type` and resolve the first matching instance,
    /// giving up after `timeout`. The underlying multicast listener is
    /// released on every exit path.
    async fn resolve_first(
        &self,
        service_type: &str,
        timeout: Duration,
    ) -> Result<Option<DiscoveryResult>>;
}

/// `ServiceDiscovery` backed by an `mdns-sd` daemon created per browse.
pub struct MdnsDiscovery {
    instance_filter: Option<String>,
}

/// Shuts the daemon down when the browse ends, including when the owning
/// future is dropped mid-browse.
struct DaemonGuard(ServiceDaemon);

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        if let Err(e) = self.0.shutdown() {
            warn!("failed to shut down mDNS daemon: {e}");
        }
    }
}

impl MdnsDiscovery {
    pub fn new(instance_filter: Option<String>) -> Self {
        Self { instance_filter }
    }

    fn matches(&self, fullname: &str) -> bool {
        match &self.instance_filter {
            Some(filter) => fullname.contains(filter.as_str()),
            None => true,
        }
    }
}

impl ServiceDiscovery for MdnsDiscovery {
    async fn resolve_first(
        &self,
        service_type: &str,
        window: Duration,
    ) -> Result<Option<DiscoveryResult>> {
        let daemon = DaemonGuard(ServiceDaemon::new().context("failed to create mDNS daemon")?);
        let receiver = daemon
            .0
            .browse(service_type)
            .context("failed to start mDNS browse")?;

        info!("browsing for {service_type}");

        let deadline = Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("mDNS browse window elapsed");
                return Ok(None);
            }

            let event = match timeout(remaining, receiver.recv_async()).await {
                Err(_) => {
                    debug!("mDNS browse window elapsed");
                    return Ok(None);
                }
                Ok(Err(_)) => bail!("mDNS browse channel closed unexpectedly"),
                Ok(Ok(event)) => event,
            };

            match event {
                ServiceEvent::ServiceResolved(resolved) => {
                    let fullname = resolved.get_fullname();
                    if !self.matches(fullname) {
                        debug!("ignoring non-matching instance {fullname}");
                        continue;
                    }

                    let Some(address) = resolved.get_addresses().iter().next().copied() else {
                        debug!("instance {fullname} resolved without addresses");
                        continue;
                    };

                    info!("resolved {fullname} at {address}");

                    if let Err(e) = daemon.0.stop_browse(service_type) {
                        debug!("failed to stop mDNS browse: {e}");
                    }

                    return Ok(Some(DiscoveryResult {
                        service_name: fullname.to_string(),
                        address,
                        resolved_at: SystemTime::now(),
                    }));
                }
                ServiceEvent::SearchStarted(ty) => debug!("mDNS search started for {ty}"),
                ServiceEvent::SearchStopped(ty) => debug!("mDNS search stopped for {ty}"),
                _ => {}
            }
        }
    }
}
