use std::collections::BTreeSet;

use thiserror::Error;

use crate::db::{Catalog, Store, StoreError};
use crate::models::Event;
use crate::utils;

#[derive(Debug, Error)]
#[error("catalog sync failed for {catalog:?}: {source}")]
pub struct CatalogSyncError {
    pub catalog: Catalog,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CatalogSummary {
    pub venues: usize,
    pub tags: usize,
}

/// Distinct venue names and tags across a batch.
pub fn distinct_entries(events: &[Event]) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut venues = BTreeSet::new();
    let mut tags = BTreeSet::new();
    for event in events {
        if let Some(name) = event.venue.name.as_ref() {
            if !utils::is_blank(name) {
                venues.insert(name.clone());
            }
        }
        tags.extend(event.tags.iter().cloned());
    }
    (venues, tags)
}

/// One upsert per distinct value, never one per event.
pub fn sync(store: &Store, events: &[Event]) -> Result<CatalogSummary, CatalogSyncError> {
    let (venues, tags) = distinct_entries(events);
    let mut summary = CatalogSummary::default();

    if !venues.is_empty() {
        summary.venues = store
            .upsert_catalog_entries(Catalog::Venues, &venues)
            .map_err(|source| CatalogSyncError {
                catalog: Catalog::Venues,
                source,
            })?;
        tracing::info!("updated {} venues in catalog", summary.venues);
    }

    if !tags.is_empty() {
        summary.tags = store
            .upsert_catalog_entries(Catalog::Tags, &tags)
            .map_err(|source| CatalogSyncError {
                catalog: Catalog::Tags,
                source,
            })?;
        tracing::info!("updated {} tags in catalog", summary.tags);
    }

    Ok(summary)
}

pub fn list(store: &Store, catalog: Catalog) -> Result<Vec<String>, StoreError> {
    store.list_catalog(catalog)
}
