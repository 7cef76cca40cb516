//! Provisions headless sensor nodes onto a Wi-Fi network: join the node's
//! temporary AP, deliver the target-network credentials over HTTP, rejoin
//! the user's network while the node reboots, and rediscover the node via
//! multicast DNS.

pub mod config;
pub mod credential_client;
pub mod discovery;
pub mod retry;
pub mod session;
pub mod wifi;
