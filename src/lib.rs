//! Encrypted SOCKS5 proxy: a local client speaks plaintext SOCKS5 to
//! applications and tunnels their traffic, AEAD-sealed, to a remote server
//! that relays it to the real destination.

pub mod address;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod metrics;
pub mod plugin;
pub mod ratelimit;
pub mod relay;
pub mod server;
pub mod socks5;
pub mod udp;

pub use client::Client;
pub use config::Config;
pub use error::Error;
pub use server::Server;
