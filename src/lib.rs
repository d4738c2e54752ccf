//! Local certificate authority for TLS interception.
//!
//! This crate keeps a long-lived root CA on disk and signs short-lived leaf
//! certificates for arbitrary hostnames on demand, so a proxy can terminate
//! TLS for any host a client asks for.
//!
//! # Architecture
//!
//! 1. [`TrustStore::bootstrap`] creates the root on first run (under an
//!    exclusive file lock, written atomically) or loads and checks the
//!    existing one.
//! 2. The root certificate is exported once and installed in client trust
//!    stores.
//! 3. [`LeafCertCache::issue`] signs a leaf per hostname, caches it until
//!    expiry, and coalesces concurrent requests for the same host.
//!    [`LeafCertCache::start`] also runs the expiry sweep when
//!    `leaf.sweep_interval_secs` is configured.
//! 4. [`server_config`] plugs the cache into rustls so handshakes pick their
//!    certificate by SNI.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use trustmint::{LeafCertCache, StoreConfig, TrustStore};
//!
//! let config = StoreConfig::in_directory("/var/lib/trustmint");
//! let store = Arc::new(TrustStore::new("/var/lib/trustmint", &config));
//! store.bootstrap().unwrap();
//!
//! let cache = LeafCertCache::start(store, config.leaf.clone());
//! let leaf = cache.issue("example.com").unwrap();
//! println!("{}", leaf.certificate().pem());
//! ```

pub mod ca;
pub mod config;
mod error;
pub mod resolver;

pub use ca::{
    BootstrapOutcome, CaEntry, CacheMetrics, Certificate, ExportFormat, KeyAlgorithm,
    KeyMaterial, LeafCertCache, LeafEntry, StorePaths, SubjectAttrs, TrustStore, Validity,
};
pub use config::{CaSettings, ConfigError, LeafSettings, StoreConfig, default_store_dir};
pub use error::{CaError, CaResult};
pub use resolver::{LeafCertResolver, server_config};
