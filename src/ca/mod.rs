//! Root CA store and on-demand leaf certificates.
//!
//! [`TrustStore`] owns the persisted root: it creates one on first use, loads
//! and checks it afterwards, and refuses to paper over a damaged store.
//! [`LeafCertCache`] signs per-host leaves with that root and keeps them until
//! they expire.

mod cache;
mod encoder;
mod flight;
mod key;
mod root;
mod store;

pub use cache::{CacheMetrics, LeafCertCache, LeafEntry, normalize_hostname};
pub use encoder::{Certificate, SubjectAttrs, Validity, self_sign, sign_leaf, wildcard_form};
pub use key::{KeyAlgorithm, KeyMaterial, MAX_RSA_BITS, MIN_RSA_BITS};
pub use root::CaEntry;
pub use store::{
    BootstrapOutcome, CERT_FILE_SUFFIX, ExportFormat, KEY_FILE_SUFFIX, StorePaths, TrustStore,
};
