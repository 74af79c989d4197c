use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use crate::storage::Database;

/// Read-only view of the primary catalog: which feed items were promoted.
#[async_trait]
pub trait PromotedLookup: Send + Sync {
    /// Return the subset of `external_ids` present in the primary catalog
    /// under `platform_tag`.
    async fn lookup_promoted_ids(
        &self,
        platform_tag: &str,
        external_ids: &[String],
    ) -> Result<HashSet<String>>;
}

/// Marks cache rows whose item already exists in the primary catalog.
///
/// The cache and primary catalog are only eventually consistent; this is a
/// read-then-patch pass with no lock held across the two stores.
#[derive(Clone)]
pub struct ImportStatusReconciler {
    lookup: Arc<dyn PromotedLookup>,
    platform_tag: String,
}

impl ImportStatusReconciler {
    pub fn new(lookup: Arc<dyn PromotedLookup>, platform_tag: impl Into<String>) -> Self {
        Self {
            lookup,
            platform_tag: platform_tag.into(),
        }
    }

    pub fn platform_tag(&self) -> &str {
        &self.platform_tag
    }

    /// Reconcile one page of ids, returning how many cache rows were marked.
    pub async fn reconcile(&self, db: &Database, external_ids: &[String], now: i64) -> Result<u64> {
        if external_ids.is_empty() {
            return Ok(0);
        }

        let promoted = self
            .lookup
            .lookup_promoted_ids(&self.platform_tag, external_ids)
            .await?;
        if promoted.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = promoted.into_iter().collect();
        let marked = db.mark_imported(&ids, now).await?;
        tracing::debug!(
            platform = %self.platform_tag,
            marked = marked,
            "Reconciled import status"
        );
        Ok(marked)
    }
}
