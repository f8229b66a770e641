//! Pluggable job logic.
//!
//! A handler implements up to five operations (`start`, `resume`, `get`, `execute`,
//! `finish`); every one defaults to a no-op. Handlers are typed by their item/cursor
//! type and registered by name; the registry erases the item type to JSON so the
//! orchestrator can persist cursors generically.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use chunkline_core::{BatchKey, HandlerError};

/// What a handler call knows about the job it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchContext {
    pub key: BatchKey,
    pub arguments: BTreeMap<String, String>,
}

impl BatchContext {
    pub fn new(key: BatchKey, arguments: BTreeMap<String, String>) -> Self {
        Self { key, arguments }
    }

    pub fn argument(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).map(String::as_str)
    }
}

/// Job-specific logic.
#[async_trait::async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    /// Item and cursor type.
    type Item: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Tag stored on the record to detect a cursor written by a different item type.
    fn item_type(&self) -> String {
        std::any::type_name::<Self::Item>().to_string()
    }

    /// A fresh run begins.
    async fn start(&self, _ctx: &BatchContext) -> Result<(), HandlerError> {
        Ok(())
    }

    /// A run with a cursor continues.
    async fn resume(&self, _ctx: &BatchContext) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Next chunk after `cursor`, at most `chunk_size` items. Empty means done.
    async fn get(
        &self,
        _ctx: &BatchContext,
        _cursor: Option<&Self::Item>,
        _chunk_size: u64,
    ) -> Result<Vec<Self::Item>, HandlerError> {
        Ok(Vec::new())
    }

    async fn execute(&self, _ctx: &BatchContext, _item: &Self::Item) -> Result<(), HandlerError> {
        Ok(())
    }

    /// `get` returned nothing; called once per run.
    async fn finish(&self, _ctx: &BatchContext) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Type-erased handler over JSON items.
#[async_trait::async_trait]
pub trait DynBatchHandler: Send + Sync {
    fn item_type(&self) -> String;

    async fn start(&self, ctx: &BatchContext) -> Result<(), HandlerError>;

    async fn resume(&self, ctx: &BatchContext) -> Result<(), HandlerError>;

    async fn get(
        &self,
        ctx: &BatchContext,
        cursor: Option<&serde_json::Value>,
        chunk_size: u64,
    ) -> Result<Vec<serde_json::Value>, HandlerError>;

    async fn execute(&self, ctx: &BatchContext, item: &serde_json::Value)
        -> Result<(), HandlerError>;

    async fn finish(&self, ctx: &BatchContext) -> Result<(), HandlerError>;
}

struct Erased<H>(H);

#[async_trait::async_trait]
impl<H: BatchHandler> DynBatchHandler for Erased<H> {
    fn item_type(&self) -> String {
        self.0.item_type()
    }

    async fn start(&self, ctx: &BatchContext) -> Result<(), HandlerError> {
        self.0.start(ctx).await
    }

    async fn resume(&self, ctx: &BatchContext) -> Result<(), HandlerError> {
        self.0.resume(ctx).await
    }

    async fn get(
        &self,
        ctx: &BatchContext,
        cursor: Option<&serde_json::Value>,
        chunk_size: u64,
    ) -> Result<Vec<serde_json::Value>, HandlerError> {
        let cursor: Option<H::Item> = cursor
            .map(|c| serde_json::from_value(c.clone()))
            .transpose()?;
        let items = self.0.get(ctx, cursor.as_ref(), chunk_size).await?;
        items
            .iter()
            .map(|item| serde_json::to_value(item).map_err(HandlerError::from))
            .collect()
    }

    async fn execute(
        &self,
        ctx: &BatchContext,
        item: &serde_json::Value,
    ) -> Result<(), HandlerError> {
        let item: H::Item = serde_json::from_value(item.clone())?;
        self.0.execute(ctx, &item).await
    }

    async fn finish(&self, ctx: &BatchContext) -> Result<(), HandlerError> {
        self.0.finish(ctx).await
    }
}

/// Name → handler map, built once at startup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn DynBatchHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`, replacing any previous one.
    pub fn register<H: BatchHandler>(&mut self, name: impl Into<String>, handler: H) {
        self.handlers.insert(name.into(), Arc::new(Erased(handler)));
    }

    pub fn with<H: BatchHandler>(mut self, name: impl Into<String>, handler: H) -> Self {
        self.register(name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DynBatchHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}
