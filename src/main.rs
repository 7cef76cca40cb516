use anyhow::{Context, Result, bail};
use env_logger::{Builder, Env, Target};
use log::{error, info, warn};
use node_provision::{
    config::AppConfig,
    credential_client::NodeCredentialClient,
    discovery::MdnsDiscovery,
    session::{ProvisioningSession, SessionEvent, SessionState, WifiCredentials},
    wifi::NmcliWifiLink,
};
use std::{io::Write, sync::Arc};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    initialize();

    let config = AppConfig::get();

    let node_ap = WifiCredentials::new(
        std::env::var("NODE_AP_SSID").context("NODE_AP_SSID missing")?,
        config.node.ap_password.clone(),
    );
    let target = WifiCredentials::new(
        std::env::var("TARGET_SSID").context("TARGET_SSID missing")?,
        std::env::var("TARGET_PASSWORD").unwrap_or_default(),
    );

    let wifi = Arc::new(NmcliWifiLink::new(config.wifi.interface.clone()));
    let transport = Arc::new(NodeCredentialClient::new(
        config.provisioning.push_request_timeout,
    )?);
    let discovery = Arc::new(MdnsDiscovery::new(config.node.instance_filter.clone()));

    let session = ProvisioningSession::new(wifi, transport, discovery, config.session_config());
    let mut events = session.subscribe();
    session.start(node_ap, target)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, abandoning session");
                session.abandon();
                return Ok(());
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        print_event(&event)?;
                        match event.state {
                            SessionState::Completed { node_address } => {
                                info!("node provisioned, reachable at {node_address}");
                                return Ok(());
                            }
                            state if state.is_terminal() => {
                                bail!("provisioning did not complete, stopped in {state:?}");
                            }
                            _ => {}
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("event stream lagged, {missed} events missed");
                    }
                    Err(RecvError::Closed) => bail!("event stream closed unexpectedly"),
                }
            }
        }
    }
}

// one JSON line per transition, for whatever frontend drives this binary
fn print_event(event: &SessionEvent) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string(event).context("failed to serialize event")?
    );
    Ok(())
}

fn initialize() {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("module version: {}", env!("CARGO_PKG_VERSION"));
}
