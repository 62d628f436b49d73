use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::asset::{AssetReader, AssetStats, MediaAsset};
use crate::config::StreamConfig;
use crate::downloader::{Downloader, KeyError};
use crate::model::{AudioVariant, TrackId, TrackInfo};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("track not found")]
    NotFound,
    #[error("metadata lookup failed: {0}")]
    Lookup(String),
}

/// Track metadata source.
///
/// In a full client this is backed by the mercury request/response client of
/// the session; tests substitute an in-memory catalog.
#[async_trait]
pub trait TrackCatalog: Send + Sync {
    async fn track_info(&self, track_id: &TrackId) -> Result<TrackInfo, CatalogError>;
}

/// Failure to pin an asset for a track
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PinError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("no playable variant for track")]
    NoVariant,
}

struct RegistryEntry {
    asset: Arc<MediaAsset>,
    handles: usize,
}

struct RegistryInner {
    downloader: Arc<Downloader>,
    catalog: Arc<dyn TrackCatalog>,
    config: StreamConfig,
    assets: Mutex<HashMap<TrackId, RegistryEntry>>,
}

/// Process-wide map from track id to its live media asset.
///
/// Each track has at most one asset regardless of how many readers pin it.
/// Assets are created lazily on the first pin and shut down when the last
/// handle is dropped.
#[derive(Clone)]
pub struct AssetRegistry {
    inner: Arc<RegistryInner>,
}

impl AssetRegistry {
    pub fn new(
        downloader: Arc<Downloader>,
        catalog: Arc<dyn TrackCatalog>,
        config: StreamConfig,
    ) -> Self {
        AssetRegistry {
            inner: Arc::new(RegistryInner {
                downloader,
                catalog,
                config,
                assets: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Pin the asset for a track, creating it on first use.
    ///
    /// `pick` selects the audio variant from the catalog's offer and returns
    /// its index; format policy belongs to the caller, not this cache. The
    /// creation path fetches metadata and the audio key with no lock held, so
    /// two racing callers may both build an asset; the loser is cancelled
    /// before it has issued any requests.
    pub async fn pin_asset<F>(&self, track_id: &TrackId, pick: F) -> Result<AssetHandle, PinError>
    where
        F: FnOnce(&[AudioVariant]) -> Option<usize>,
    {
        if let Some(handle) = self.pin_existing(track_id) {
            return Ok(handle);
        }

        let info = self.inner.catalog.track_info(track_id).await?;
        let variant = pick(&info.variants)
            .and_then(|index| info.variants.get(index))
            .ok_or(PinError::NoVariant)?
            .clone();
        let key = self
            .inner
            .downloader
            .fetch_key(track_id, &variant.file_id)
            .await?;
        let asset = MediaAsset::start(
            info.label,
            variant.format,
            variant.file_id,
            key,
            Arc::clone(&self.inner.downloader),
            &self.inner.config,
        );

        let mut assets = self.inner.assets.lock().unwrap();
        match assets.entry(*track_id) {
            Entry::Occupied(mut entry) => {
                // Lost a creation race; keep the winner.
                asset.cancel();
                entry.get_mut().handles += 1;
                Ok(self.handle_for(track_id, Arc::clone(&entry.get().asset)))
            }
            Entry::Vacant(entry) => {
                debug!(track = %track_id, label = %asset.label(), "registered asset");
                entry.insert(RegistryEntry {
                    asset: Arc::clone(&asset),
                    handles: 1,
                });
                Ok(self.handle_for(track_id, asset))
            }
        }
    }

    /// Number of live assets
    pub fn len(&self) -> usize {
        self.inner.assets.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pin_existing(&self, track_id: &TrackId) -> Option<AssetHandle> {
        let mut assets = self.inner.assets.lock().unwrap();
        let entry = assets.get_mut(track_id)?;
        entry.handles += 1;
        Some(self.handle_for(track_id, Arc::clone(&entry.asset)))
    }

    fn handle_for(&self, track_id: &TrackId, asset: Arc<MediaAsset>) -> AssetHandle {
        AssetHandle {
            registry: Arc::downgrade(&self.inner),
            track_id: *track_id,
            asset,
        }
    }

    fn unpin(inner: &RegistryInner, track_id: &TrackId) {
        let mut assets = inner.assets.lock().unwrap();
        let Some(entry) = assets.get_mut(track_id) else {
            return;
        };
        entry.handles = entry.handles.saturating_sub(1);
        if entry.handles == 0 {
            if let Some(entry) = assets.remove(track_id) {
                entry.asset.cancel();
                debug!(track = %track_id, "dropped asset");
            }
        }
    }
}

/// Ref-counted claim on a media asset.
///
/// Cloning pins the asset again; dropping the last handle cancels the asset
/// and removes it from the registry.
pub struct AssetHandle {
    registry: Weak<RegistryInner>,
    track_id: TrackId,
    asset: Arc<MediaAsset>,
}

impl AssetHandle {
    pub fn asset(&self) -> &Arc<MediaAsset> {
        &self.asset
    }

    pub fn label(&self) -> &str {
        self.asset.label()
    }

    pub fn media_type(&self) -> &str {
        self.asset.media_type()
    }

    pub fn stats(&self) -> AssetStats {
        self.asset.stats()
    }

    /// Open a byte-oriented reader over the asset.
    pub fn new_reader(&self) -> AssetReader {
        AssetReader::new(Arc::clone(&self.asset))
    }
}

impl Clone for AssetHandle {
    fn clone(&self) -> Self {
        if let Some(inner) = self.registry.upgrade() {
            if let Some(entry) = inner.assets.lock().unwrap().get_mut(&self.track_id) {
                entry.handles += 1;
            }
        }
        AssetHandle {
            registry: self.registry.clone(),
            track_id: self.track_id,
            asset: Arc::clone(&self.asset),
        }
    }
}

impl Drop for AssetHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            AssetRegistry::unpin(&inner, &self.track_id);
        }
    }
}
