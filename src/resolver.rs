//! rustls integration: serve leaves from a [`LeafCertCache`] by SNI.

use std::sync::Arc;

use rustls::ServerConfig;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, error};

use crate::ca::LeafCertCache;
use crate::error::CaError;

/// Certificate resolver that issues leaves on demand based on SNI.
pub struct LeafCertResolver {
    cache: Arc<LeafCertCache>,
}

impl LeafCertResolver {
    pub fn new(cache: Arc<LeafCertCache>) -> Self {
        Self { cache }
    }

    /// The chain and key to present for `server_name`, issuing if needed.
    ///
    /// Names the cache refuses to sign come from the client and are only
    /// logged at debug level; any other failure is on our side.
    pub fn certified_key_for(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        match self.cache.issue(server_name) {
            Ok(entry) => Some(entry.certified_key()),
            Err(CaError::Encoding(reason)) => {
                debug!("not issuing for client-supplied name: {}", reason);
                None
            }
            Err(e) => {
                error!("failed to issue certificate for {}: {}", server_name, e);
                None
            }
        }
    }
}

impl std::fmt::Debug for LeafCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for LeafCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(sni) = client_hello.server_name() else {
            debug!("client sent no SNI, no certificate to offer");
            return None;
        };
        debug!("resolving certificate for SNI: {}", sni);
        self.certified_key_for(sni)
    }
}

/// A rustls `ServerConfig` whose certificates come from `cache`.
pub fn server_config(cache: Arc<LeafCertCache>) -> Arc<ServerConfig> {
    let resolver = Arc::new(LeafCertResolver::new(cache));
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    Arc::new(config)
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConnection, StreamOwned};
    use tempfile::tempdir;

    use super::*;
    use crate::ca::{KeyAlgorithm, TrustStore};
    use crate::config::{LeafSettings, StoreConfig};

    /// Tests a full handshake: a client trusting only the root accepts the
    /// leaf issued for the SNI it sent.
    #[test]
    fn handshake_with_issued_leaf() {
        let temp = tempdir().unwrap();
        let mut config = StoreConfig::default();
        config.ca.key_algorithm = KeyAlgorithm::EcdsaP256;
        let store = Arc::new(TrustStore::new(temp.path(), &config));
        let root = store.bootstrap().unwrap();
        let cache = Arc::new(LeafCertCache::new(store, LeafSettings::default()));
        let server_config = server_config(Arc::clone(&cache));

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let conn = ServerConnection::new(server_config).unwrap();
            let mut tls = StreamOwned::new(conn, stream);
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).unwrap();
            tls.write_all(&buf).unwrap();
            tls.flush().unwrap();
        });

        let mut roots = RootCertStore::empty();
        roots.add(root.certificate().der().clone()).unwrap();
        let client_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let name = ServerName::try_from("secure.example.com").unwrap();
        let conn = ClientConnection::new(Arc::new(client_config), name).unwrap();
        let mut tls = StreamOwned::new(conn, TcpStream::connect(addr).unwrap());

        tls.write_all(b"ping").unwrap();
        let mut reply = [0u8; 4];
        tls.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ping");
        server.join().unwrap();

        assert_eq!(cache.metrics().issued, 1);
        assert_eq!(cache.len(), 1);
    }

    /// Tests that a name the cache will not sign yields no certificate,
    /// while a valid one on the same resolver still does.
    #[test]
    fn malformed_name_yields_nothing() {
        let temp = tempdir().unwrap();
        let mut config = StoreConfig::default();
        config.ca.key_algorithm = KeyAlgorithm::EcdsaP256;
        let store = Arc::new(TrustStore::new(temp.path(), &config));
        store.bootstrap().unwrap();
        let cache = Arc::new(LeafCertCache::new(store, LeafSettings::default()));
        let resolver = LeafCertResolver::new(Arc::clone(&cache));

        assert!(resolver.certified_key_for("bad..example.com").is_none());
        assert!(resolver.certified_key_for(&"a".repeat(300)).is_none());
        assert!(cache.is_empty());

        let key = resolver.certified_key_for("good.example.com").unwrap();
        assert_eq!(key.cert.len(), 2);
        assert_eq!(cache.len(), 1);
    }

    /// Tests that a store that was never bootstrapped yields no certificate.
    #[test]
    fn unbootstrapped_store_yields_nothing() {
        let temp = tempdir().unwrap();
        let store = Arc::new(TrustStore::at(temp.path()));
        let cache = Arc::new(LeafCertCache::new(store, LeafSettings::default()));
        let resolver = LeafCertResolver::new(cache);
        assert!(resolver.certified_key_for("example.com").is_none());
    }

    /// Tests that the resolver's Debug output stays opaque.
    #[test]
    fn resolver_debug() {
        let temp = tempdir().unwrap();
        let store = Arc::new(TrustStore::at(temp.path()));
        let cache = Arc::new(LeafCertCache::new(store, LeafSettings::default()));
        let rendered = format!("{:?}", LeafCertResolver::new(cache));
        assert_eq!(rendered, "LeafCertResolver { .. }");
    }
}
