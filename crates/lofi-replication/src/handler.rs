//! Remote endpoint seams
//!
//! The engine never talks to a network itself. Applications plug in a
//! [`PushHandler`], a [`PullHandler`] and optionally a [`PullStream`].

use crate::error::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lofi_core::Document;
use std::sync::Arc;

/// Per-call context handed to every handler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteContext {
    /// Bearer token from the `token` local document
    pub token: Option<String>,
}

/// One document in a push batch
#[derive(Debug, Clone, PartialEq)]
pub struct PushRow {
    pub new_document: Document,
    /// The remote state the local change was based on
    pub assumed_master: Option<Document>,
}

/// Result of one pull request
#[derive(Debug, Clone, PartialEq)]
pub struct PullBatch {
    pub documents: Vec<Document>,
    /// Opaque remote checkpoint; `None` keeps the previous one
    pub checkpoint: Option<serde_json::Value>,
}

/// Item of the live pull stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Batch(PullBatch),
    /// The remote lost track of this client; run a full pull
    Resync,
}

#[async_trait]
pub trait PushHandler: Send + Sync {
    /// Send local changes. Returns the remote documents that conflicted
    /// with the rows' assumed masters.
    async fn push(&self, ctx: &RemoteContext, collection: &str, rows: Vec<PushRow>) -> Result<Vec<Document>>;
}

#[async_trait]
pub trait PullHandler: Send + Sync {
    /// Fetch documents changed after `checkpoint`
    async fn pull(
        &self,
        ctx: &RemoteContext,
        collection: &str,
        checkpoint: Option<&serde_json::Value>,
        batch_size: usize,
    ) -> Result<PullBatch>;
}

#[async_trait]
pub trait PullStream: Send + Sync {
    /// Open the live stream of remote changes
    async fn connect(
        &self,
        ctx: &RemoteContext,
        collection: &str,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;
}

/// The set of handlers of one remote endpoint
#[derive(Clone)]
pub struct Remote {
    /// Name under which checkpoints are stored
    pub endpoint: String,
    pub push: Arc<dyn PushHandler>,
    pub pull: Arc<dyn PullHandler>,
    pub stream: Option<Arc<dyn PullStream>>,
}

impl Remote {
    pub fn new(endpoint: impl Into<String>, push: Arc<dyn PushHandler>, pull: Arc<dyn PullHandler>) -> Self {
        Self {
            endpoint: endpoint.into(),
            push,
            pull,
            stream: None,
        }
    }

    pub fn with_stream(mut self, stream: Arc<dyn PullStream>) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Use one object for all three handlers
    pub fn from_handler<H>(endpoint: impl Into<String>, handler: Arc<H>) -> Self
    where
        H: PushHandler + PullHandler + PullStream + 'static,
    {
        Self {
            endpoint: endpoint.into(),
            push: handler.clone(),
            pull: handler.clone(),
            stream: Some(handler),
        }
    }
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("endpoint", &self.endpoint)
            .field("stream", &self.stream.is_some())
            .finish()
    }
}
