//! Label-keyed persistence for the CA private key and certificate.
//!
//! Every write is create-if-absent: storing under a label that is already
//! occupied succeeds and leaves the existing item in place.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::RsaPrivateKey;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key store I/O failed for {label}: {source}")]
    Io {
        label: String,
        #[source]
        source: io::Error,
    },
    #[error("private key encoding failed: {0}")]
    KeyEncoding(#[source] rsa::pkcs8::Error),
    #[error("key store backend unavailable: {0}")]
    Backend(&'static str),
}

/// Opaque secure storage for the root CA material.
pub trait KeyStore: Send + Sync {
    fn get_certificate(&self, label: &str) -> Option<Vec<u8>>;
    fn store_certificate(&self, der: &[u8], label: &str) -> Result<(), StoreError>;
    fn store_private_key(&self, key: &RsaPrivateKey, label: &str) -> Result<(), StoreError>;
    fn get_private_key(&self, label: &str) -> Option<RsaPrivateKey>;
}

/// Process-local store. Private keys are held PKCS#8-encoded and wiped on drop.
#[derive(Default)]
pub struct MemoryKeyStore {
    certificates: Mutex<HashMap<String, Vec<u8>>>,
    private_keys: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn get_certificate(&self, label: &str) -> Option<Vec<u8>> {
        self.certificates.lock().ok()?.get(label).cloned()
    }

    fn store_certificate(&self, der: &[u8], label: &str) -> Result<(), StoreError> {
        let mut certificates = self
            .certificates
            .lock()
            .map_err(|_| StoreError::Backend("certificate table poisoned"))?;
        if certificates.contains_key(label) {
            debug!(target: "key_store", label, "certificate already present, keeping existing");
            return Ok(());
        }
        certificates.insert(label.to_string(), der.to_vec());
        Ok(())
    }

    fn store_private_key(&self, key: &RsaPrivateKey, label: &str) -> Result<(), StoreError> {
        let encoded = key.to_pkcs8_der().map_err(StoreError::KeyEncoding)?;
        let mut keys = self
            .private_keys
            .lock()
            .map_err(|_| StoreError::Backend("private key table poisoned"))?;
        if keys.contains_key(label) {
            debug!(target: "key_store", label, "private key already present, keeping existing");
            return Ok(());
        }
        keys.insert(label.to_string(), Zeroizing::new(encoded.as_bytes().to_vec()));
        Ok(())
    }

    fn get_private_key(&self, label: &str) -> Option<RsaPrivateKey> {
        let keys = self.private_keys.lock().ok()?;
        RsaPrivateKey::from_pkcs8_der(keys.get(label)?).ok()
    }
}

/// Directory-backed store. Each item is one owner-only file; writes land in a
/// temporary file first and are published with a hard link, which fails if the
/// label is taken, so concurrent writers cannot clobber each other.
pub struct FileKeyStore {
    root: PathBuf,
}

impl FileKeyStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn certificate_path(&self, label: &str) -> PathBuf {
        self.root.join(format!("{}.cert.der", file_stem(label)))
    }

    fn private_key_path(&self, label: &str) -> PathBuf {
        self.root.join(format!("{}.key.der", file_stem(label)))
    }

    /// Returns `false` when the target already existed.
    fn create_if_absent(&self, path: &Path, bytes: &[u8], label: &str) -> Result<bool, StoreError> {
        let io_error = |source| StoreError::Io {
            label: label.to_string(),
            source,
        };

        fs::create_dir_all(&self.root).map_err(io_error)?;

        let tmp_path = self
            .root
            .join(format!(".{}.{:016x}.tmp", file_stem(label), rand::thread_rng().next_u64()));
        let tmp_path = scopeguard::guard(tmp_path, |path| {
            let _ = fs::remove_file(path);
        });

        let mut file = owner_only_options().open(&*tmp_path).map_err(io_error)?;
        file.write_all(bytes).map_err(io_error)?;
        file.sync_all().map_err(io_error)?;
        drop(file);

        match fs::hard_link(&*tmp_path, path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(io_error(e)),
        }
    }
}

impl KeyStore for FileKeyStore {
    fn get_certificate(&self, label: &str) -> Option<Vec<u8>> {
        fs::read(self.certificate_path(label)).ok()
    }

    fn store_certificate(&self, der: &[u8], label: &str) -> Result<(), StoreError> {
        let created = self.create_if_absent(&self.certificate_path(label), der, label)?;
        if !created {
            debug!(target: "key_store", label, "certificate already present, keeping existing");
        }
        Ok(())
    }

    fn store_private_key(&self, key: &RsaPrivateKey, label: &str) -> Result<(), StoreError> {
        let encoded = key.to_pkcs8_der().map_err(StoreError::KeyEncoding)?;
        let created = self.create_if_absent(&self.private_key_path(label), encoded.as_bytes(), label)?;
        if !created {
            debug!(target: "key_store", label, "private key already present, keeping existing");
        }
        Ok(())
    }

    fn get_private_key(&self, label: &str) -> Option<RsaPrivateKey> {
        let bytes = Zeroizing::new(fs::read(self.private_key_path(label)).ok()?);
        RsaPrivateKey::from_pkcs8_der(&bytes).ok()
    }
}

fn owner_only_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
}

/// Lossless file name for a label: ASCII alphanumerics and `-` are kept, every
/// other byte (including `_`) becomes `_xx`.
fn file_stem(label: &str) -> String {
    let mut stem = String::with_capacity(label.len());
    for byte in label.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("_{byte:02x}"));
        }
    }
    stem
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x509::tests::{other_test_key, test_key};

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("sni-intercept-store-{:016x}", rand::random::<u64>()))
    }

    fn first_certificate_write_wins(store: &dyn KeyStore) {
        assert_eq!(store.get_certificate("root"), None);

        store.store_certificate(b"first", "root").unwrap();
        store.store_certificate(b"second", "root").unwrap();

        assert_eq!(store.get_certificate("root").as_deref(), Some(&b"first"[..]));
        assert_eq!(store.get_certificate("other"), None);
    }

    fn private_key_round_trips(store: &dyn KeyStore) {
        assert!(store.get_private_key("root-PrivateKey").is_none());

        store.store_private_key(test_key(), "root-PrivateKey").unwrap();
        let loaded = store.get_private_key("root-PrivateKey").unwrap();
        assert_eq!(&loaded, test_key());
    }

    fn first_private_key_write_wins(store: &dyn KeyStore) {
        store.store_private_key(test_key(), "root-PrivateKey").unwrap();
        store.store_private_key(other_test_key(), "root-PrivateKey").unwrap();

        assert_eq!(&store.get_private_key("root-PrivateKey").unwrap(), test_key());
    }

    fn similar_labels_stay_distinct(store: &dyn KeyStore) {
        store.store_certificate(b"first", "root/ca").unwrap();
        store.store_certificate(b"second", "root_ca").unwrap();
        store.store_certificate(b"third", "root ca").unwrap();

        assert_eq!(store.get_certificate("root/ca").as_deref(), Some(&b"first"[..]));
        assert_eq!(store.get_certificate("root_ca").as_deref(), Some(&b"second"[..]));
        assert_eq!(store.get_certificate("root ca").as_deref(), Some(&b"third"[..]));
    }

    #[test]
    fn memory_store_keeps_first_certificate() {
        first_certificate_write_wins(&MemoryKeyStore::new());
    }

    #[test]
    fn memory_store_round_trips_private_key() {
        private_key_round_trips(&MemoryKeyStore::new());
    }

    #[test]
    fn memory_store_keeps_first_private_key() {
        first_private_key_write_wins(&MemoryKeyStore::new());
    }

    #[test]
    fn memory_store_keeps_labels_apart() {
        similar_labels_stay_distinct(&MemoryKeyStore::new());
    }

    #[test]
    fn file_store_keeps_first_private_key() {
        let dir = scratch_dir();
        scopeguard::defer! { let _ = fs::remove_dir_all(&dir); }

        first_private_key_write_wins(&FileKeyStore::new(&dir));
    }

    #[test]
    fn file_store_keeps_labels_apart() {
        let dir = scratch_dir();
        scopeguard::defer! { let _ = fs::remove_dir_all(&dir); }

        similar_labels_stay_distinct(&FileKeyStore::new(&dir));
    }

    #[test]
    fn file_store_keeps_first_certificate() {
        let dir = scratch_dir();
        scopeguard::defer! { let _ = fs::remove_dir_all(&dir); }

        first_certificate_write_wins(&FileKeyStore::new(&dir));
    }

    #[test]
    fn file_store_round_trips_private_key() {
        let dir = scratch_dir();
        scopeguard::defer! { let _ = fs::remove_dir_all(&dir); }

        private_key_round_trips(&FileKeyStore::new(&dir));
    }

    #[test]
    fn file_store_leaves_no_temporary_files() {
        let dir = scratch_dir();
        scopeguard::defer! { let _ = fs::remove_dir_all(&dir); }

        let store = FileKeyStore::new(&dir);
        store.store_certificate(b"der", "LocationCollector RootCA/1").unwrap();
        store.store_certificate(b"again", "LocationCollector RootCA/1").unwrap();

        let names: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["LocationCollector_20RootCA_2f1.cert.der".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn file_store_writes_owner_only_files() {
        use std::os::unix::fs::PermissionsExt;

        let dir = scratch_dir();
        scopeguard::defer! { let _ = fs::remove_dir_all(&dir); }

        let store = FileKeyStore::new(&dir);
        store.store_private_key(test_key(), "k").unwrap();
        let mode = fs::metadata(dir.join("k.key.der")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
