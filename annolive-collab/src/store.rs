//! Annotation store collaborator.
//!
//! The store is the system of record for committed annotations and task
//! counters. Rooms fetch from it on creation and write through it on every
//! commit; any failure is reported as `UpstreamStoreUnavailable`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::CollabError;
use crate::progress::TaskStats;
use crate::protocol::{Annotation, DocumentKey};

#[async_trait]
pub trait AnnotationStore: Send + Sync {
    async fn annotations(&self, document: &DocumentKey) -> Result<Vec<Annotation>, CollabError>;

    async fn commit(&self, document: &DocumentKey, annotation: &Annotation) -> Result<(), CollabError>;

    /// Delete a committed annotation. Unknown ids are not an error.
    async fn remove(&self, document: &DocumentKey, annotation_id: &str) -> Result<(), CollabError>;

    async fn task_stats(&self, document: &DocumentKey) -> Result<TaskStats, CollabError>;
}

#[derive(Debug, Default)]
struct DocumentRecord {
    annotations: Vec<Annotation>,
    stats: TaskStats,
}

/// In-process store with an availability switch for exercising degraded mode.
#[derive(Debug)]
pub struct MemoryAnnotationStore {
    documents: RwLock<HashMap<DocumentKey, DocumentRecord>>,
    available: AtomicBool,
}

impl Default for MemoryAnnotationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAnnotationStore {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        log::info!("Memory store availability set to {available}");
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub async fn set_task_stats(&self, document: &DocumentKey, stats: TaskStats) {
        self.documents
            .write()
            .await
            .entry(document.clone())
            .or_default()
            .stats = stats;
    }

    /// Seed annotations directly, bypassing availability.
    pub async fn seed(&self, document: &DocumentKey, annotations: Vec<Annotation>) {
        self.documents
            .write()
            .await
            .entry(document.clone())
            .or_default()
            .annotations
            .extend(annotations);
    }

    fn check(&self) -> Result<(), CollabError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(CollabError::UpstreamStoreUnavailable("memory store switched off".into()))
        }
    }
}

#[async_trait]
impl AnnotationStore for MemoryAnnotationStore {
    async fn annotations(&self, document: &DocumentKey) -> Result<Vec<Annotation>, CollabError> {
        self.check()?;
        Ok(self
            .documents
            .read()
            .await
            .get(document)
            .map(|d| d.annotations.clone())
            .unwrap_or_default())
    }

    async fn commit(&self, document: &DocumentKey, annotation: &Annotation) -> Result<(), CollabError> {
        self.check()?;
        let mut documents = self.documents.write().await;
        let record = documents.entry(document.clone()).or_default();
        record.annotations.retain(|a| a.id != annotation.id);
        record.annotations.push(annotation.clone());
        Ok(())
    }

    async fn remove(&self, document: &DocumentKey, annotation_id: &str) -> Result<(), CollabError> {
        self.check()?;
        if let Some(record) = self.documents.write().await.get_mut(document) {
            record.annotations.retain(|a| a.id != annotation_id);
        }
        Ok(())
    }

    async fn task_stats(&self, document: &DocumentKey) -> Result<TaskStats, CollabError> {
        self.check()?;
        Ok(self
            .documents
            .read()
            .await
            .get(document)
            .map(|d| d.stats)
            .unwrap_or_default())
    }
}
