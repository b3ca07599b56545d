//! Hostgate - a host-routed reverse proxy with a domain registry
//!
//! This library provides:
//! - A SQLite registry of domains and subdomains, each served as a static
//!   site or proxied to a local port
//! - Per-handshake (SNI) certificate and per-request (Host) route resolution
//! - Certificate lifecycle management: a self-signed default pair, DNS-01
//!   issuance through certbot or a native ACME client, wildcard sharing and
//!   scheduled renewal
//! - A reverse proxy speaking HTTP/1.1 and HTTP/2 with connection pooling

pub mod adapter;
pub mod certs;
pub mod config;
pub mod db;
pub mod domains;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod resolver;
pub mod static_files;
pub mod tools;

/// Package name
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
