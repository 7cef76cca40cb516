use crate::{
    retry::{Backoff, RetryPolicy},
    session::SessionConfig,
};
use anyhow::{Context, Result, ensure};
use std::{env, sync::OnceLock, time::Duration};

/// Application configuration loaded and validated at startup. The session
/// itself never reads this; it receives an explicit `SessionConfig` value.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub wifi: WifiConfig,
    pub node: NodeConfig,
    pub provisioning: ProvisioningConfig,
}

#[derive(Clone, Debug)]
pub struct WifiConfig {
    /// Interface to pin `nmcli` to; unset lets NetworkManager choose.
    pub interface: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// mDNS service type the node advertises once provisioned.
    pub service_type: String,
    /// Optional substring filter on resolved instance names.
    pub instance_filter: Option<String>,
    /// Fixed manufacturer credential of the node's temporary AP; empty for
    /// an open AP.
    pub ap_password: String,
}

#[derive(Clone, Debug)]
pub struct ProvisioningConfig {
    pub push_max_attempts: u32,
    pub push_backoff: Duration,
    pub push_request_timeout: Duration,
    pub rejoin_timeout: Duration,
    pub discovery_timeout: Duration,
}

impl AppConfig {
    /// Get or load the application configuration.
    ///
    /// # Panics
    /// Panics if configuration loading fails. This is intentional as the
    /// application cannot function without valid configuration.
    pub fn get() -> &'static Self {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        APP_CONFIG.get_or_init(|| {
            Self::load_internal().expect("failed to load application configuration")
        })
    }

    fn load_internal() -> Result<Self> {
        Ok(Self {
            wifi: WifiConfig::load(),
            node: NodeConfig::load(),
            provisioning: ProvisioningConfig::load()?,
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            push_retry: RetryPolicy::new(
                self.provisioning.push_max_attempts,
                Backoff::Fixed(self.provisioning.push_backoff),
            ),
            rejoin_timeout: self.provisioning.rejoin_timeout,
            discovery_timeout: self.provisioning.discovery_timeout,
            service_type: self.node.service_type.clone(),
        }
    }
}

impl WifiConfig {
    fn load() -> Self {
        Self {
            interface: env::var("WIFI_INTERFACE").ok().filter(|s| !s.is_empty()),
        }
    }
}

impl NodeConfig {
    fn load() -> Self {
        let service_type =
            env::var("NODE_SERVICE_TYPE").unwrap_or_else(|_| "_http._tcp.local.".to_string());
        let instance_filter = env::var("NODE_INSTANCE_FILTER")
            .ok()
            .filter(|s| !s.is_empty());
        let ap_password = env::var("NODE_AP_PASSWORD").unwrap_or_default();

        Self {
            service_type,
            instance_filter,
            ap_password,
        }
    }
}

impl ProvisioningConfig {
    fn load() -> Result<Self> {
        let push_max_attempts = env::var("PUSH_MAX_ATTEMPTS")
            .unwrap_or_else(|_| "3".to_string())
            .parse::<u32>()
            .context("failed to parse PUSH_MAX_ATTEMPTS: invalid format")?;
        ensure!(push_max_attempts > 0, "PUSH_MAX_ATTEMPTS must be at least 1");

        let push_backoff = Duration::from_millis(
            env::var("PUSH_BACKOFF_MS")
                .unwrap_or_else(|_| "2000".to_string())
                .parse()
                .context("failed to parse PUSH_BACKOFF_MS: invalid format")?,
        );

        let push_request_timeout = Duration::from_secs(
            env::var("PUSH_REQUEST_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("failed to parse PUSH_REQUEST_TIMEOUT_SECS: invalid format")?,
        );

        let rejoin_timeout = Duration::from_secs(
            env::var("REJOIN_TIMEOUT_SECS")
                .unwrap_or_else(|_| "120".to_string())
                .parse()
                .context("failed to parse REJOIN_TIMEOUT_SECS: invalid format")?,
        );

        let discovery_timeout = Duration::from_secs(
            env::var("DISCOVERY_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("failed to parse DISCOVERY_TIMEOUT_SECS: invalid format")?,
        );

        Ok(Self {
            push_max_attempts,
            push_backoff,
            push_request_timeout,
            rejoin_timeout,
            discovery_timeout,
        })
    }
}
