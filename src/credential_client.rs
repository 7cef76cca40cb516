use crate::session::WifiCredentials;
use anyhow::{Context, Result, ensure};
use log::{error, info};
#[cfg(feature = "mock")]
use mockall::automock;
use reqwest::Client;
use std::{net::Ipv4Addr, time::Duration};
use trait_variant::make;

/// Path of the credential endpoint a node exposes on its temporary AP.
const CONNECT_PATH: &str = "/_ac/connect";

/// URL of the credential endpoint for a node reachable at `gateway`.
pub fn connect_url(gateway: Ipv4Addr) -> String {
    format!("http://{gateway}{CONNECT_PATH}")
}

/// Delivers target-network credentials to a node over its temporary AP.
#[make(Send)]
#[cfg_attr(feature = "mock", automock)]
pub trait CredentialTransport {
    /// POST the credentials to `url`. Never raises; any transport error or
    /// non-success response yields `false` with the cause logged.
    async fn push(&self, url: &str, credentials: &WifiCredentials) -> bool;
}

/// `CredentialTransport` speaking the node's plain-HTTP form protocol. The
/// transfer runs over the node's open temporary AP; that exposure is an
/// accepted tradeoff of the provisioning scheme.
pub struct NodeCredentialClient {
    client: Client,
}

impl NodeCredentialClient {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to create HTTP client")?;

        Ok(Self { client })
    }

    async fn try_push(&self, url: &str, credentials: &WifiCredentials) -> Result<()> {
        info!("POST {url}");

        let res = self
            .client
            .post(url)
            .form(&[
                ("SSID", credentials.ssid.as_str()),
                ("PWD", credentials.password.as_str()),
            ])
            .send()
            .await
            .context(format!("failed to send POST request to {url}"))?;

        let status = res.status();
        ensure!(status.is_success(), "POST {url} failed with status {status}");

        Ok(())
    }
}

impl CredentialTransport for NodeCredentialClient {
    async fn push(&self, url: &str, credentials: &WifiCredentials) -> bool {
        match self.try_push(url, credentials).await {
            Ok(()) => true,
            Err(e) => {
                error!("credential push failed: {e:#}");
                false
            }
        }
    }
}
