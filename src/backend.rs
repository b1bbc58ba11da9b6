//! Collaborators the cache talks to but does not own: the content-addressed
//! store behind the VFS and an optional embedding model.

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::cache::entry::CacheKey;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// The backend has no content for the key. Not a cache error.
    #[error("key not found")]
    NotFound,

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbedError {
    #[error("embedding model unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

/// Source of truth for cached payloads.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn fetch(&self, key: &CacheKey) -> Result<Bytes, FetchError>;
}

/// Turns text into a fixed-dimension embedding.
#[async_trait]
pub trait Embedder: Send + Sync + 'static {
    async fn embed(&self, content: &str) -> Result<Vec<f32>, EmbedError>;
}

type FetchFuture = Pin<Box<dyn Future<Output = Result<Bytes, FetchError>> + Send>>;

/// Adapts an async closure into a [`Backend`].
pub struct FnBackend {
    fetch: Arc<dyn Fn(CacheKey) -> FetchFuture + Send + Sync>,
}

impl FnBackend {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(CacheKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, FetchError>> + Send + 'static,
    {
        Self {
            fetch: Arc::new(move |key| Box::pin(f(key))),
        }
    }
}

#[async_trait]
impl Backend for FnBackend {
    async fn fetch(&self, key: &CacheKey) -> Result<Bytes, FetchError> {
        (self.fetch)(key.clone()).await
    }
}

/// Serves `<root>/<key>` files. Keys must be relative paths without `..`.
pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &CacheKey) -> Option<PathBuf> {
        let rel = std::str::from_utf8(key.as_bytes()).ok()?;
        let rel = Path::new(rel.trim_start_matches('/'));
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return None;
        }
        Some(self.root.join(rel))
    }
}

#[async_trait]
impl Backend for DirectoryBackend {
    async fn fetch(&self, key: &CacheKey) -> Result<Bytes, FetchError> {
        let path = self.resolve(key).ok_or(FetchError::NotFound)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FetchError::NotFound),
            Err(e) => Err(FetchError::Unavailable(format!("{}: {e}", path.display()))),
        }
    }
}
