//! On-disk root CA store.
//!
//! A store directory holds one PEM certificate and one PKCS#8 PEM key, named
//! after the configured basename, plus a lock file used to serialise
//! bootstrap across processes:
//!
//! ```text
//! <dir>/<basename>-ca-cert.pem   0644
//! <dir>/<basename>-ca-key.pem    0600
//! <dir>/.<basename>.lock
//! <dir>/.<basename>.staging/     0700, only while a root is being written
//! ```
//!
//! A new root is first written in full to the staging directory. The key is
//! then renamed into place, followed by the certificate. A crash between the
//! two renames leaves a key on disk whose certificate is still staged; the
//! next bootstrap finishes that commit under the lock, and discards any
//! staged root whose key never made it out.
//!
//! An existing root is never replaced implicitly: a missing half or a
//! mismatched pair is reported as corruption, and replacement only happens
//! through [`TrustStore::regenerate`].

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use nix::fcntl::{Flock, FlockArg};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::encoder::{Certificate, SubjectAttrs, Validity};
use super::key::KeyMaterial;
use super::root::CaEntry;
use crate::config::{CaSettings, StoreConfig};
use crate::error::{CaError, CaResult};

pub const CERT_FILE_SUFFIX: &str = "-ca-cert.pem";
pub const KEY_FILE_SUFFIX: &str = "-ca-key.pem";

const DIR_MODE: u32 = 0o700;
const KEY_FILE_MODE: u32 = 0o600;
const CERT_FILE_MODE: u32 = 0o644;

/// Locations of the files that make up a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub dir: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub lock_path: PathBuf,
    pub staging_dir: PathBuf,
}

impl StorePaths {
    pub fn new(dir: &Path, basename: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            cert_path: dir.join(format!("{basename}{CERT_FILE_SUFFIX}")),
            key_path: dir.join(format!("{basename}{KEY_FILE_SUFFIX}")),
            lock_path: dir.join(format!(".{basename}.lock")),
            staging_dir: dir.join(format!(".{basename}.staging")),
        }
    }

    /// Where `target` is written before it is committed.
    fn staged(&self, target: &Path) -> PathBuf {
        match target.file_name() {
            Some(name) => self.staging_dir.join(name),
            None => self.staging_dir.join("unnamed"),
        }
    }
}

/// Encoding used when exporting the root certificate for trust anchoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Pem,
    Der,
}

impl ExportFormat {
    /// `.cer` and `.der` files get DER, everything else PEM.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("der") || ext.eq_ignore_ascii_case("cer") => {
                Self::Der
            }
            _ => Self::Pem,
        }
    }
}

/// How [`TrustStore::bootstrap_with_outcome`] obtained the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// No root existed; a new one was generated and written.
    Created,
    /// The root was read from disk.
    Loaded,
    /// This handle had already bootstrapped.
    Cached,
}

/// Long-lived handle on a store directory and its root CA.
///
/// Share it (usually in an `Arc`) with everything that signs leaves; the
/// loaded root is kept in memory after the first bootstrap.
pub struct TrustStore {
    paths: StorePaths,
    settings: CaSettings,
    root: RwLock<Option<Arc<CaEntry>>>,
}

impl TrustStore {
    pub fn new(dir: impl AsRef<Path>, config: &StoreConfig) -> Self {
        Self {
            paths: StorePaths::new(dir.as_ref(), &config.basename),
            settings: config.ca.clone(),
            root: RwLock::new(None),
        }
    }

    /// A store in `dir` with default settings.
    pub fn at(dir: impl AsRef<Path>) -> Self {
        Self::new(dir, &StoreConfig::default())
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// The root, if this handle has bootstrapped.
    pub fn root(&self) -> Option<Arc<CaEntry>> {
        self.root
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Ensures a root exists in the store directory and returns it.
    pub fn bootstrap(&self) -> CaResult<Arc<CaEntry>> {
        self.bootstrap_with_outcome().map(|(root, _)| root)
    }

    /// Like [`bootstrap`](Self::bootstrap), also reporting whether the root
    /// was created, loaded, or already held.
    pub fn bootstrap_with_outcome(&self) -> CaResult<(Arc<CaEntry>, BootstrapOutcome)> {
        if let Some(root) = self.root() {
            return Ok((root, BootstrapOutcome::Cached));
        }

        let _lock = self.lock_directory()?;
        if let Some(root) = self.root() {
            return Ok((root, BootstrapOutcome::Cached));
        }
        self.recover_staged()?;

        let cert_exists = exists(&self.paths.cert_path)?;
        let key_exists = exists(&self.paths.key_path)?;
        let (entry, outcome) = match (cert_exists, key_exists) {
            (true, true) => (self.load()?, BootstrapOutcome::Loaded),
            (false, false) => (self.create()?, BootstrapOutcome::Created),
            (true, false) => {
                return Err(CaError::corrupted(
                    &self.paths.key_path,
                    "root certificate present but private key missing",
                ));
            }
            (false, true) => {
                return Err(CaError::corrupted(
                    &self.paths.cert_path,
                    "private key present but root certificate missing",
                ));
            }
        };

        self.warn_if_expiring(&entry);
        Ok((self.install(entry), outcome))
    }

    /// Replaces the root with a newly generated one.
    ///
    /// Every certificate signed by the old root stops validating once clients
    /// trust only the new one.
    pub fn regenerate(&self) -> CaResult<Arc<CaEntry>> {
        let _lock = self.lock_directory()?;
        let entry = self.create()?;
        warn!(
            "replaced root CA in {}; redistribute {}",
            self.paths.dir.display(),
            self.paths.cert_path.display()
        );
        Ok(self.install(entry))
    }

    /// Writes the root certificate to `out` for import into a trust store.
    pub fn export_certificate(&self, out: &Path, format: ExportFormat) -> CaResult<()> {
        let root = self.bootstrap()?;
        let certificate = root.certificate();
        let contents: &[u8] = match format {
            ExportFormat::Pem => certificate.pem().as_bytes(),
            ExportFormat::Der => certificate.der(),
        };
        if let Some(parent) = out.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| CaError::io(parent, e))?;
        }
        write_atomic(out, contents, CERT_FILE_MODE)?;
        info!("exported root certificate to {}", out.display());
        Ok(())
    }

    fn install(&self, entry: CaEntry) -> Arc<CaEntry> {
        let entry = Arc::new(entry);
        *self
            .root
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::clone(&entry));
        entry
    }

    /// Creates the directory if needed and takes the exclusive store lock.
    /// Blocks while another process or handle holds it.
    fn lock_directory(&self) -> CaResult<Flock<File>> {
        DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(&self.paths.dir)
            .map_err(|e| CaError::io(&self.paths.dir, e))?;

        let lock_path = &self.paths.lock_path;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .mode(KEY_FILE_MODE)
            .open(lock_path)
            .map_err(|e| CaError::io(lock_path, e))?;

        debug!("waiting for store lock {}", lock_path.display());
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| CaError::io(lock_path, std::io::Error::from(errno)))
    }

    fn load(&self) -> CaResult<CaEntry> {
        let key_path = &self.paths.key_path;
        let cert_path = &self.paths.cert_path;

        let key_pem = fs::read_to_string(key_path).map_err(|e| CaError::io(key_path, e))?;
        let cert_pem = fs::read_to_string(cert_path).map_err(|e| CaError::io(cert_path, e))?;

        let key = KeyMaterial::from_pem(&key_pem)
            .map_err(|e| CaError::corrupted(key_path, e.to_string()))?;
        let certificate = Certificate::from_pem(&cert_pem)
            .map_err(|e| CaError::corrupted(cert_path, e.to_string()))?;

        if certificate.is_expired_at(OffsetDateTime::now_utc()) {
            return Err(CaError::corrupted(
                cert_path,
                format!(
                    "root certificate expired at {}; regenerate it explicitly",
                    certificate.not_after()
                ),
            ));
        }

        let entry = CaEntry::new(key, certificate)
            .map_err(|e| CaError::corrupted(&self.paths.dir, e.to_string()))?;
        self.warn_if_key_readable();

        info!(
            "loaded root CA {} from {}",
            entry.certificate().subject(),
            self.paths.dir.display()
        );
        Ok(entry)
    }

    /// Generates a root and commits it through the staging directory.
    /// Existing files are overwritten; callers hold the lock and have
    /// already decided that is wanted.
    fn create(&self) -> CaResult<CaEntry> {
        let mut subject = SubjectAttrs::new(self.settings.common_name.clone());
        if let Some(org) = &self.settings.organization {
            subject = subject.with_organization(org.clone());
        }
        let entry = CaEntry::generate(
            self.settings.key_algorithm,
            self.settings.key_bits(),
            &subject,
            &Validity::days_from_now(self.settings.validity_days)?,
        )?;

        let paths = &self.paths;
        let staged_key = paths.staged(&paths.key_path);
        let staged_cert = paths.staged(&paths.cert_path);
        remove_staging(&paths.staging_dir)?;
        DirBuilder::new()
            .mode(DIR_MODE)
            .create(&paths.staging_dir)
            .map_err(|e| CaError::io(&paths.staging_dir, e))?;
        write_new(&staged_key, entry.key().private_key_pem().as_bytes(), KEY_FILE_MODE)?;
        write_new(&staged_cert, entry.certificate().pem().as_bytes(), CERT_FILE_MODE)?;
        sync_dir(&paths.staging_dir)?;

        rename(&staged_key, &paths.key_path)?;
        sync_dir(&paths.dir)?;
        rename(&staged_cert, &paths.cert_path)?;
        sync_dir(&paths.dir)?;
        remove_staging(&paths.staging_dir)?;

        info!(
            "created root CA {} ({}) in {}",
            entry.certificate().subject(),
            entry.key().algorithm(),
            self.paths.dir.display()
        );
        Ok(entry)
    }

    /// Finishes or discards a root write that was interrupted. Must run
    /// under the store lock.
    ///
    /// A staged certificate is committed only when the key already in place
    /// belongs to it; anything else left in staging never became the root.
    fn recover_staged(&self) -> CaResult<()> {
        let paths = &self.paths;
        if !exists(&paths.staging_dir)? {
            return Ok(());
        }

        let staged_cert = paths.staged(&paths.cert_path);
        if exists(&staged_cert)? && exists(&paths.key_path)? && self.completes_key(&staged_cert)? {
            rename(&staged_cert, &paths.cert_path)?;
            sync_dir(&paths.dir)?;
            warn!(
                "finished interrupted root CA write in {}",
                paths.dir.display()
            );
        } else {
            warn!(
                "discarding incomplete root CA staged in {}",
                paths.staging_dir.display()
            );
        }
        remove_staging(&paths.staging_dir)
    }

    /// Whether the key at `key_path` pairs with the certificate at `cert`.
    fn completes_key(&self, cert: &Path) -> CaResult<bool> {
        let key_path = &self.paths.key_path;
        let key_pem = fs::read_to_string(key_path).map_err(|e| CaError::io(key_path, e))?;
        let cert_pem = fs::read_to_string(cert).map_err(|e| CaError::io(cert, e))?;
        let (Ok(key), Ok(certificate)) =
            (KeyMaterial::from_pem(&key_pem), Certificate::from_pem(&cert_pem))
        else {
            return Ok(false);
        };
        Ok(CaEntry::new(key, certificate).is_ok())
    }

    /// Logs a warning when `entry` expires inside the warning window.
    /// Returns whether it did.
    fn warn_if_expiring(&self, entry: &CaEntry) -> bool {
        let not_after = entry.certificate().not_after();
        let remaining = not_after - OffsetDateTime::now_utc();
        if remaining > time::Duration::days(i64::from(self.settings.expiry_warning_days)) {
            return false;
        }
        warn!(
            "root CA {} expires at {} ({} days left)",
            entry.certificate().subject(),
            not_after,
            remaining.whole_days()
        );
        true
    }

    /// Logs a warning when group or other can reach the root key.
    /// Returns whether it did.
    fn warn_if_key_readable(&self) -> bool {
        let Ok(meta) = fs::metadata(&self.paths.key_path) else {
            return false;
        };
        let mode = meta.permissions().mode() & 0o777;
        if mode & 0o077 == 0 {
            return false;
        }
        warn!(
            "root key {} is accessible to other users (mode {:o})",
            self.paths.key_path.display(),
            mode
        );
        true
    }
}

impl std::fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustStore")
            .field("paths", &self.paths)
            .field("root", &self.root())
            .finish_non_exhaustive()
    }
}

fn exists(path: &Path) -> CaResult<bool> {
    path.try_exists().map_err(|e| CaError::io(path, e))
}

fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> CaResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(".trustmint-")
        .suffix(".tmp")
        .permissions(fs::Permissions::from_mode(mode))
        .tempfile_in(dir)
        .map_err(|e| CaError::io(dir, e))?;
    tmp.write_all(contents).map_err(|e| CaError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| CaError::io(tmp.path(), e))?;

    tmp.persist(path).map_err(|e| CaError::io(path, e.error))?;
    debug!("wrote {}", path.display());
    Ok(())
}

fn write_new(path: &Path, contents: &[u8], mode: u32) -> CaResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
        .map_err(|e| CaError::io(path, e))?;
    file.write_all(contents).map_err(|e| CaError::io(path, e))?;
    file.sync_all().map_err(|e| CaError::io(path, e))
}

fn rename(from: &Path, to: &Path) -> CaResult<()> {
    fs::rename(from, to).map_err(|e| CaError::io(to, e))?;
    debug!("committed {}", to.display());
    Ok(())
}

fn remove_staging(dir: &Path) -> CaResult<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CaError::io(dir, e)),
    }
}

fn sync_dir(dir: &Path) -> CaResult<()> {
    File::open(dir)
        .and_then(|handle| handle.sync_all())
        .map_err(|e| CaError::io(dir, e))
}
