//! Durable local storage for submissions, the user profile, integrations and
//! the sync queue.
//!
//! ```text
//! ┌──────────────┐  typed values  ┌──────────────────┐  bytes  ┌───────────────┐
//! │ WorkflowStore│ ─────────────► │  DurableStore    │ ──────► │ KeyValueBackend│
//! │ SyncQueue    │                │ (bincode + LZ4,  │         │  RocksBackend  │
//! └──────────────┘                │  logs & absorbs) │         │  MemoryBackend │
//!                                 └──────────────────┘         └───────────────┘
//! ```
//!
//! Keys are namespaced: `workflows/{id}`, `user/profile`, `syncQueue/{id}`,
//! `integrations/{id}`.
//! The RocksDB backend maps each namespace to its own column family.

pub mod durable;
pub mod memory;
pub mod rocks;

use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub use durable::{DurableStore, RecoveryReport};
pub use memory::MemoryBackend;
pub use rocks::{RocksBackend, RocksConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    Workflows,
    User,
    SyncQueue,
    Integrations,
}

impl Namespace {
    pub const ALL: [Namespace; 4] = [
        Namespace::Workflows,
        Namespace::User,
        Namespace::SyncQueue,
        Namespace::Integrations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Workflows => "workflows",
            Namespace::User => "user",
            Namespace::SyncQueue => "syncQueue",
            Namespace::Integrations => "integrations",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ns| ns.as_str() == s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreKey {
    pub namespace: Namespace,
    pub id: String,
}

impl StoreKey {
    pub fn new(namespace: Namespace, id: impl Into<String>) -> Self {
        Self {
            namespace,
            id: id.into(),
        }
    }

    pub fn workflow(id: Uuid) -> Self {
        Self::new(Namespace::Workflows, id.to_string())
    }

    pub fn user_profile() -> Self {
        Self::new(Namespace::User, "profile")
    }

    pub fn sync_item(id: Uuid) -> Self {
        Self::new(Namespace::SyncQueue, id.to_string())
    }

    pub fn integration(id: Uuid) -> Self {
        Self::new(Namespace::Integrations, id.to_string())
    }

    /// Parse the `namespace/id` form.
    pub fn parse(key: &str) -> Result<Self, StoreError> {
        let (ns, id) = key
            .split_once('/')
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        let namespace = Namespace::parse(ns).ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        if id.is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(Self::new(namespace, id))
    }

    /// The id as a UUID, for namespaces keyed by one.
    pub fn uuid(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.id).ok()
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace.as_str(), self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("write rejected: {0}")]
    WriteRejected(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Raw byte storage. Implementations only move bytes; encoding lives in
/// [`DurableStore`].
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    async fn put(&self, key: &StoreKey, value: Vec<u8>) -> Result<(), StoreError>;

    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError>;

    async fn delete(&self, key: &StoreKey) -> Result<(), StoreError>;

    /// Every entry in a namespace, ordered by key.
    async fn entries(&self, namespace: Namespace) -> Result<Vec<(StoreKey, Vec<u8>)>, StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;
}

/// bincode, then LZ4 with the uncompressed size prepended.
pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}
