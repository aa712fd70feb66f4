use anyhow::{Context, Result};
use directories::BaseDirs;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Durable key-value storage for the two credential strings.
pub trait CredentialStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Stores each credential as a small file under `<root>/secrets`.
#[derive(Clone)]
pub struct FileCredentialStorage {
    root: PathBuf,
}

impl FileCredentialStorage {
    pub fn new(root: PathBuf) -> Self {
        fs::create_dir_all(root.join("secrets")).ok();
        Self { root }
    }

    /// `<config_dir>/woodchat`, or `.woodchat` when no home directory is known.
    pub fn default_root() -> PathBuf {
        match BaseDirs::new() {
            Some(base) => base.config_dir().join("woodchat"),
            None => PathBuf::from(".woodchat"),
        }
    }

    pub fn temporary() -> Self {
        let mut path = std::env::temp_dir();
        path.push(format!("woodchat-{}", Uuid::new_v4()));
        Self::new(path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn secret_path(&self, key: &str) -> PathBuf {
        self.root.join("secrets").join(format!("{key}.txt"))
    }
}

impl CredentialStorage for FileCredentialStorage {
    fn get(&self, key: &str) -> Option<String> {
        let contents = fs::read_to_string(self.secret_path(key)).ok()?;
        let trimmed = contents.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.secret_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file =
            File::create(&path).with_context(|| format!("failed to write {}", path.display()))?;
        file.write_all(value.as_bytes())?;
        restrict_permissions(&path);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.secret_path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {key}")),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        tracing::warn!(error = %err, "failed to restrict credential file permissions");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

#[derive(Default)]
pub struct MemoryCredentialStorage {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryCredentialStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStorage for MemoryCredentialStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.write().remove(key);
        Ok(())
    }
}
