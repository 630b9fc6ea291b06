//! Secret store
//!
//! Resolves an opaque key handle to signing capability. Key material only
//! exists inside a [`SecretStore::with_signer`] call: the buffer is
//! `Zeroizing` and is wiped when the scope ends, including on panic unwind.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

lazy_static::lazy_static! {
    static ref KEY_HANDLE: regex::Regex =
        regex::Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("Invalid key handle regex");
}

/// Signing capability handed to chain signing code
///
/// Never cloned, never serialized; `Debug` is redacted.
pub struct SigningKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl SigningKey {
    pub(crate) fn from_bytes(bytes: Zeroizing<Vec<u8>>) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(Error::Secret(format!(
                "Signing key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    /// Raw key bytes, for chain signing code only
    pub(crate) fn expose_secret(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKey(***)")
    }
}

/// Backend that materializes a key for a handle
pub trait KeySource: Send + Sync {
    /// Load the key for `handle`; the caller owns (and drops) the result
    fn load(&self, handle: &str) -> Result<SigningKey>;
}

/// Decode a hex key (optionally `0x`-prefixed) into a zeroizing buffer
fn decode_hex_key(text: &str) -> Result<Zeroizing<Vec<u8>>> {
    let trimmed = text.trim();
    let hex_part = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(hex_part).map_err(|e| Error::Secret(format!("Invalid key encoding: {}", e)))?;
    Ok(Zeroizing::new(bytes))
}

/// Keys stored as `<keys_dir>/<handle>.key`, hex encoded
pub struct FileKeySource {
    keys_dir: PathBuf,
}

impl FileKeySource {
    pub fn new(keys_dir: impl Into<PathBuf>) -> Self {
        Self {
            keys_dir: keys_dir.into(),
        }
    }

    fn key_path(&self, handle: &str) -> PathBuf {
        self.keys_dir.join(format!("{}.key", handle))
    }

    /// Refuse key files readable by group or others
    #[cfg(unix)]
    fn check_permissions(path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(path) {
            let mode = metadata.permissions().mode();
            if mode & 0o077 != 0 {
                return Err(Error::Secret(format!(
                    "Key file {} has insecure permissions {:o}. Run 'chmod 600 {}'",
                    path.display(),
                    mode & 0o777,
                    path.display()
                )));
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn check_permissions(_path: &Path) -> Result<()> {
        Ok(())
    }
}

impl KeySource for FileKeySource {
    /// Reads the key file on every call
    ///
    /// On a multi-threaded runtime the read runs under `block_in_place` so
    /// the worker's other tasks move elsewhere while the disk is touched.
    fn load(&self, handle: &str) -> Result<SigningKey> {
        let path = self.key_path(handle);
        let read = || -> Result<SigningKey> {
            Self::check_permissions(&path)?;
            let text = Zeroizing::new(std::fs::read_to_string(&path).map_err(|e| {
                Error::Secret(format!("Failed to read key for handle {}: {}", handle, e))
            })?);
            SigningKey::from_bytes(decode_hex_key(&text)?)
        };

        match Handle::try_current() {
            Ok(runtime) if runtime.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(read)
            }
            // block_in_place panics on a current-thread runtime
            _ => read(),
        }
    }
}

/// In-process keys for dry runs and tests
#[derive(Default)]
pub struct MemoryKeySource {
    keys: DashMap<String, Zeroizing<Vec<u8>>>,
}

impl MemoryKeySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hex-encoded key under a handle
    pub fn insert_hex(&self, handle: &str, key_hex: &str) -> Result<()> {
        let bytes = decode_hex_key(key_hex)?;
        SigningKey::from_bytes(bytes.clone())?;
        self.keys.insert(handle.to_string(), bytes);
        Ok(())
    }

    /// Register a throwaway key derived from the handle name
    pub fn insert_derived(&self, handle: &str) {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(format!("dry-run:{}", handle).as_bytes());
        self.keys
            .insert(handle.to_string(), Zeroizing::new(digest.to_vec()));
    }
}

impl KeySource for MemoryKeySource {
    fn load(&self, handle: &str) -> Result<SigningKey> {
        let bytes = self
            .keys
            .get(handle)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::Secret(format!("Unknown key handle: {}", handle)))?;
        SigningKey::from_bytes(bytes)
    }
}

/// Scoped access to signing keys
pub struct SecretStore {
    source: Arc<dyn KeySource>,
}

impl SecretStore {
    pub fn new(source: Arc<dyn KeySource>) -> Self {
        Self { source }
    }

    /// File-backed store rooted at `keys_dir`
    pub fn from_dir(keys_dir: &Path) -> Self {
        Self::new(Arc::new(FileKeySource::new(keys_dir)))
    }

    /// Run `f` with the signing key for `handle`
    ///
    /// The key is dropped (and zeroed) before this returns, on every path.
    pub fn with_signer<T, F>(&self, handle: &str, f: F) -> Result<T>
    where
        F: FnOnce(&SigningKey) -> Result<T>,
    {
        if !KEY_HANDLE.is_match(handle) {
            return Err(Error::Secret(format!("Malformed key handle: {:?}", handle)));
        }

        let key = self.source.load(handle)?;
        debug!(handle = %handle, "Signing key resolved");
        let result = f(&key);
        drop(key);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[test]
    fn test_memory_store_scoped_access() {
        let source = Arc::new(MemoryKeySource::new());
        source.insert_hex("master", KEY).unwrap();
        let store = SecretStore::new(source);

        let len = store.with_signer("master", |key| Ok(key.expose_secret().len())).unwrap();
        assert_eq!(len, 32);

        assert!(matches!(
            store.with_signer("missing", |_| Ok(())),
            Err(Error::Secret(_))
        ));
    }

    #[test]
    fn test_rejects_path_like_handles() {
        let store = SecretStore::new(Arc::new(MemoryKeySource::new()));
        assert!(store.with_signer("../etc/passwd", |_| Ok(())).is_err());
        assert!(store.with_signer("", |_| Ok(())).is_err());
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = SigningKey::from_bytes(decode_hex_key(KEY).unwrap()).unwrap();
        assert_eq!(format!("{:?}", key), "SigningKey(***)");
    }

    #[test]
    fn test_error_inside_scope_propagates() {
        let source = Arc::new(MemoryKeySource::new());
        source.insert_derived("w1");
        let store = SecretStore::new(source);

        let result: Result<()> =
            store.with_signer("w1", |_| Err(Error::Internal("sign failed".into())));
        assert!(matches!(result, Err(Error::Internal(_))));
    }

    fn key_dir() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master.key");
        std::fs::write(&path, KEY).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        }
        dir
    }

    #[test]
    fn test_file_source_loads_key() {
        let dir = key_dir();
        let store = SecretStore::from_dir(dir.path());
        let first = store
            .with_signer("master", |key| Ok(key.expose_secret()[0]))
            .unwrap();
        assert_eq!(first, 0x4c);
    }

    #[tokio::test]
    async fn test_file_source_on_current_thread_runtime() {
        let dir = key_dir();
        let store = SecretStore::from_dir(dir.path());
        assert!(store.with_signer("master", |_| Ok(())).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_file_source_on_worker_threads() {
        let dir = key_dir();
        let store = Arc::new(SecretStore::from_dir(dir.path()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.with_signer("master", |key| Ok(key.expose_secret()[0]))
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 0x4c);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_file_source_rejects_world_readable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("loose.key");
        std::fs::write(&path, KEY).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let store = SecretStore::from_dir(dir.path());
        assert!(matches!(
            store.with_signer("loose", |_| Ok(())),
            Err(Error::Secret(_))
        ));
    }

    #[test]
    fn test_wrong_length_rejected() {
        let source = MemoryKeySource::new();
        assert!(source.insert_hex("short", "0xdeadbeef").is_err());
    }
}
