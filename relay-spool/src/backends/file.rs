//! Directory-backed [`BackingStore`](crate::spool::BackingStore).
//!
//! Each message is written as a pair of files named after its
//! [`SpooledMessageId`]: `<ulid>.bin` holds the bincode-encoded [`Context`]
//! (with `data` stripped, per its `#[serde(skip)]`), and `<ulid>.eml` holds
//! the raw message bytes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use empath_common::{Signal, context::Context, internal};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, de};
use tokio::sync::broadcast;

use crate::{
    Result, SerializationError, SpoolError, ValidationError,
    spool::{BackingStore, SpooledMessageId},
};

fn default_path() -> PathBuf {
    PathBuf::from("/var/spool/relay")
}

#[cfg(unix)]
const SYSTEM_DIRECTORIES: &[&str] = &[
    "/etc", "/bin", "/sbin", "/usr/bin", "/boot", "/sys", "/proc", "/dev",
];

#[cfg(windows)]
const SYSTEM_DIRECTORIES: &[&str] = &[
    "c:\\windows",
    "c:\\program files",
    "c:\\program files (x86)",
    "c:\\programdata",
];

fn validate_path(path: &Path) -> std::result::Result<(), ValidationError> {
    let display = path.display().to_string();

    if display.contains("..") {
        return Err(ValidationError::InvalidConfiguration(format!(
            "spool path cannot contain '..': {display}"
        )));
    }

    if !path.is_absolute() {
        return Err(ValidationError::InvalidConfiguration(format!(
            "spool path must be absolute: {display}"
        )));
    }

    let lowered = display.to_ascii_lowercase();
    if SYSTEM_DIRECTORIES
        .iter()
        .any(|dir| lowered.starts_with(dir))
    {
        return Err(ValidationError::InvalidConfiguration(format!(
            "spool path must not be a system directory: {display}"
        )));
    }

    Ok(())
}

/// Spool backed by a directory of `<ulid>.bin`/`<ulid>.eml` file pairs.
#[derive(Debug, Clone)]
pub struct FileBackingStore {
    path: PathBuf,
}

impl Default for FileBackingStore {
    fn default() -> Self {
        Self {
            path: default_path(),
        }
    }
}

impl<'de> Deserialize<'de> for FileBackingStore {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default = "default_path")]
            path: PathBuf,
        }

        let raw = Raw::deserialize(deserializer)?;
        validate_path(&raw.path).map_err(de::Error::custom)?;
        Ok(Self { path: raw.path })
    }
}

impl FileBackingStore {
    #[must_use]
    pub fn builder() -> FileBackingStoreBuilder {
        FileBackingStoreBuilder::default()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn bin_path(&self, id: &SpooledMessageId) -> PathBuf {
        self.path.join(format!("{id}.bin"))
    }

    fn eml_path(&self, id: &SpooledMessageId) -> PathBuf {
        self.path.join(format!("{id}.eml"))
    }

    /// Create the spool directory if it doesn't already exist.
    ///
    /// # Errors
    ///
    /// Returns [`SpoolError::Validation`] if the path exists and is not a
    /// directory, or [`SpoolError::Io`] if it cannot be created.
    pub fn init(&mut self) -> Result<()> {
        if self.path.exists() {
            if !self.path.is_dir() {
                return Err(SpoolError::Validation(ValidationError::NotDirectory(
                    self.path.display().to_string(),
                )));
            }
        } else {
            std::fs::create_dir_all(&self.path)?;
        }

        Ok(())
    }

    /// Watch the spool directory for externally-dropped messages until
    /// `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying filesystem watcher cannot be
    /// started.
    pub async fn watch(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
                if let Ok(event) = event {
                    let _ = tx.send(event);
                }
            })
            .map_err(|err| SpoolError::WatchError(err.to_string()))?;

        watcher
            .watch(&self.path, RecursiveMode::NonRecursive)
            .map_err(|err| SpoolError::WatchError(err.to_string()))?;

        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                Some(event) = rx.recv() => {
                    internal!("Spool directory event: {event:?}");
                }
            }
        }
    }
}

#[async_trait]
impl BackingStore for FileBackingStore {
    async fn write(&self, context: &mut Context) -> Result<SpooledMessageId> {
        let id = SpooledMessageId::generate();
        context.tracking_id = Some(id.to_string());

        let metadata = bincode::serde::encode_to_vec(&*context, bincode::config::standard())
            .map_err(|err| SpoolError::Serialization(SerializationError::Encode(err)))?;
        tokio::fs::write(self.bin_path(&id), metadata).await?;

        if let Some(data) = context.data() {
            tokio::fs::write(self.eml_path(&id), data.as_ref()).await?;
        }

        Ok(id)
    }

    async fn list(&self) -> Result<Vec<SpooledMessageId>> {
        let mut entries = tokio::fs::read_dir(&self.path).await?;
        let mut ids = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str()
                && let Some(id) = SpooledMessageId::from_filename(name)
                && !ids.contains(&id)
            {
                ids.push(id);
            }
        }

        ids.sort();
        Ok(ids)
    }

    async fn read(&self, id: &SpooledMessageId) -> Result<Context> {
        let bin_path = self.bin_path(id);
        let bytes = tokio::fs::read(&bin_path)
            .await
            .map_err(|_| SpoolError::NotFound(id.clone()))?;

        let (mut context, _): (Context, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|err| SpoolError::Serialization(SerializationError::Decode(err)))?;

        if let Ok(data) = tokio::fs::read(self.eml_path(id)).await {
            context.set_data(data);
        }

        Ok(context)
    }

    async fn update(&self, id: &SpooledMessageId, context: &Context) -> Result<()> {
        if !self.bin_path(id).exists() {
            return Err(SpoolError::NotFound(id.clone()));
        }

        let metadata = bincode::serde::encode_to_vec(context, bincode::config::standard())
            .map_err(|err| SpoolError::Serialization(SerializationError::Encode(err)))?;
        tokio::fs::write(self.bin_path(id), metadata).await?;

        if let Some(data) = context.data() {
            tokio::fs::write(self.eml_path(id), data.as_ref()).await?;
        }

        Ok(())
    }

    async fn delete(&self, id: &SpooledMessageId) -> Result<()> {
        if !self.bin_path(id).exists() {
            return Err(SpoolError::NotFound(id.clone()));
        }

        tokio::fs::remove_file(self.bin_path(id)).await?;
        let _ = tokio::fs::remove_file(self.eml_path(id)).await;

        Ok(())
    }
}

/// Builder for [`FileBackingStore`].
#[derive(Debug, Default)]
pub struct FileBackingStoreBuilder {
    path: Option<PathBuf>,
}

impl FileBackingStoreBuilder {
    #[must_use]
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    /// # Errors
    ///
    /// Returns [`ValidationError`] if the configured path is relative,
    /// contains `..`, or falls under a known system directory.
    pub fn build(self) -> std::result::Result<FileBackingStore, ValidationError> {
        let path = self.path.unwrap_or_else(default_path);
        validate_path(&path)?;
        Ok(FileBackingStore { path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempfile_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("relay-spool-test-{}", SpooledMessageId::generate()));
        dir
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile_dir();
        let mut store = FileBackingStore::builder()
            .path(dir.clone())
            .build()
            .unwrap();
        store.init().unwrap();

        let mut context = Context::new("test.example.com");
        context.set_data(b"Subject: hi\r\n\r\nbody\r\n".to_vec());

        let id = store.write(&mut context).await.unwrap();
        let read_back = store.read(&id).await.unwrap();

        assert_eq!(read_back.id, "test.example.com");
        assert_eq!(
            read_back.data().unwrap().as_ref(),
            context.data().unwrap().as_ref()
        );

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn delete_missing_id_errors() {
        let dir = tempfile_dir();
        let mut store = FileBackingStore::builder()
            .path(dir.clone())
            .build()
            .unwrap();
        store.init().unwrap();

        let result = store.delete(&SpooledMessageId::generate()).await;
        assert!(matches!(result, Err(SpoolError::NotFound(_))));

        std::fs::remove_dir_all(dir).ok();
    }
}
