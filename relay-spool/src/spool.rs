use async_trait::async_trait;
use empath_common::context::Context;

pub use crate::{
    backends::{file::FileBackingStore, memory::MemoryBackingStore, test::TestBackingStore},
    types::SpooledMessageId,
};
use crate::Result;

/// A storage backend capable of persisting and retrieving spooled messages.
///
/// Implementors assign each written [`Context`] a [`SpooledMessageId`] and
/// own the durability/ordering guarantees for that id.
#[async_trait]
pub trait BackingStore: Send + Sync + std::fmt::Debug {
    /// Persist `context`, assigning and stamping its `tracking_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be durably written.
    async fn write(&self, context: &mut Context) -> Result<SpooledMessageId>;

    /// List the ids of all currently spooled messages, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be enumerated.
    async fn list(&self) -> Result<Vec<SpooledMessageId>>;

    /// Read back a previously written message.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SpoolError::NotFound`] if `id` is not present.
    async fn read(&self, id: &SpooledMessageId) -> Result<Context>;

    /// Overwrite a previously written message in place.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SpoolError::NotFound`] if `id` is not present.
    async fn update(&self, id: &SpooledMessageId, context: &Context) -> Result<()>;

    /// Remove a message from the store.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SpoolError::NotFound`] if `id` is not present.
    async fn delete(&self, id: &SpooledMessageId) -> Result<()>;
}

/// A spool backed by a concrete [`BackingStore`] implementation.
#[derive(Debug, Clone)]
pub struct Spool<S> {
    store: S,
}

impl<S> Spool<S> {
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    pub const fn store(&self) -> &S {
        &self.store
    }
}

impl<S: BackingStore> Spool<S> {
    /// # Errors
    ///
    /// See [`BackingStore::write`].
    pub async fn write(&self, context: &mut Context) -> Result<SpooledMessageId> {
        self.store.write(context).await
    }

    /// # Errors
    ///
    /// See [`BackingStore::list`].
    pub async fn list(&self) -> Result<Vec<SpooledMessageId>> {
        self.store.list().await
    }

    /// # Errors
    ///
    /// See [`BackingStore::read`].
    pub async fn read(&self, id: &SpooledMessageId) -> Result<Context> {
        self.store.read(id).await
    }

    /// # Errors
    ///
    /// See [`BackingStore::update`].
    pub async fn update(&self, id: &SpooledMessageId, context: &Context) -> Result<()> {
        self.store.update(id, context).await
    }

    /// # Errors
    ///
    /// See [`BackingStore::delete`].
    pub async fn delete(&self, id: &SpooledMessageId) -> Result<()> {
        self.store.delete(id).await
    }
}

pub type MemorySpool = Spool<MemoryBackingStore>;
pub type TestSpool = Spool<TestBackingStore>;
pub type FileSpool = Spool<FileBackingStore>;

impl FileSpool {
    /// Prepare the on-disk spool directory, replaying anything left over
    /// from a previous run.
    ///
    /// # Errors
    ///
    /// Returns an error if the spool directory cannot be created or read.
    pub fn init(&mut self) -> Result<()> {
        self.store.init()
    }

    /// Run the directory watcher until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying file watcher fails.
    pub async fn serve(
        &self,
        shutdown: tokio::sync::broadcast::Receiver<empath_common::Signal>,
    ) -> Result<()> {
        self.store.watch(shutdown).await
    }
}
