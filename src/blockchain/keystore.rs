use log::info;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use std::fs;
use std::path::{Path, PathBuf};

/// Length of a freshly generated secret
pub const SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("Key file error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Key file {0} is empty")]
    Empty(PathBuf),
}

/// Durable secret for encrypting medical payloads, created on first use
pub trait SecretStore: Send + Sync {
    fn get_or_create_secret(&self) -> Result<Vec<u8>, KeyStoreError>;
}

/// Secret kept in a file readable only by its owner
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileSecretStore {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn io_error(&self, source: std::io::Error) -> KeyStoreError {
        KeyStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn create(&self) -> Result<Vec<u8>, KeyStoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        let mut secret = vec![0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut secret);

        fs::write(&self.path, &secret).map_err(|e| self.io_error(e))?;
        restrict_permissions(&self.path).map_err(|e| self.io_error(e))?;

        info!("Created encryption key at {}", self.path.display());
        Ok(secret)
    }
}

impl SecretStore for FileSecretStore {
    fn get_or_create_secret(&self) -> Result<Vec<u8>, KeyStoreError> {
        if !self.path.exists() {
            return self.create();
        }

        let secret = fs::read(&self.path).map_err(|e| self.io_error(e))?;
        if secret.is_empty() {
            return Err(KeyStoreError::Empty(self.path.clone()));
        }

        Ok(secret)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Secret held in memory for the lifetime of the process
#[derive(Debug, Clone)]
pub struct MemorySecretStore {
    secret: Vec<u8>,
}

impl MemorySecretStore {
    pub fn new(secret: Vec<u8>) -> Self {
        MemorySecretStore { secret }
    }

    /// Random secret that does not survive a restart
    pub fn ephemeral() -> Self {
        let mut secret = vec![0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut secret);
        MemorySecretStore { secret }
    }
}

impl SecretStore for MemorySecretStore {
    fn get_or_create_secret(&self) -> Result<Vec<u8>, KeyStoreError> {
        Ok(self.secret.clone())
    }
}
