mod reader;

pub use reader::AssetReader;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::codec::{self, ChunkCipher, DecryptError};
use crate::config::StreamConfig;
use crate::downloader::{Downloader, KeyError};
use crate::model::{AudioFormat, AudioKey, FileId};
use crate::protocol::TransportError;

/// Errors surfaced to readers of a media asset. All but `Eof` are sticky:
/// once one is set on an asset, every later call observes it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssetError {
    /// Read past the final chunk. Normal termination, never logged as an error.
    #[error("end of stream")]
    Eof,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Decrypt(#[from] DecryptError),
    #[error("asset cancelled")]
    Cancelled,
    #[error("reader is closed")]
    Closed,
}

/// Cache slot for one chunk of one asset
enum ChunkSlot {
    /// Requested from the downloader; the channel id is known once the
    /// request packet is on the wire.
    InFlight { channel_id: u16 },
    /// Received in full; the ciphertext is with the coordinator for
    /// decryption.
    ReceivedEncrypted,
    /// Decrypted and readable. `readers` pins the chunk against eviction,
    /// `access_stamp` orders eviction candidates.
    Ready {
        data: Arc<Vec<u8>>,
        access_stamp: u64,
        readers: u32,
    },
}

struct CompletedChunk {
    index: u32,
    data: Vec<u8>,
    total_bytes: Option<u64>,
}

struct AssetState {
    chunks: HashMap<u32, ChunkSlot>,
    /// 0 until the first chunk's headers reveal the real size
    total_bytes: u64,
    /// Derived from `total_bytes`; meaningless until the size is known
    final_chunk: u32,
    /// Chunk index most recently asked for by any reader; anchors the
    /// read-ahead window
    latest_read: u32,
    in_flight: u32,
    access_counter: u64,
    fatal: Option<AssetError>,
}

/// Point-in-time cache statistics for one asset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetStats {
    /// Encoded file size, 0 while still unknown
    pub total_bytes: u64,
    /// Number of decrypted chunks currently resident
    pub resident_chunks: usize,
    /// Number of chunk fetches currently outstanding
    pub in_flight: u32,
}

/// Per-file chunk cache.
///
/// Owns the map of chunk states, schedules read-ahead, evicts stale chunks
/// and coordinates blocked readers. A single coordinator task per asset
/// serializes decryption and publication of completed chunks; readers
/// rendezvous with it through the asset mutex and a broadcast channel.
pub struct MediaAsset {
    weak_self: Weak<MediaAsset>,
    label: String,
    media_type: &'static str,
    file_id: FileId,
    cipher: ChunkCipher,
    /// Container header bytes readers skip (167 for OGG variants)
    data_start_offset: u64,
    resident_limit: usize,
    read_ahead: u32,
    max_concurrent_fetches: u32,
    downloader: Arc<Downloader>,
    runtime: tokio::runtime::Handle,
    state: Mutex<AssetState>,
    /// Signalled whenever a chunk becomes readable or the asset fails
    chunk_change: watch::Sender<()>,
    completed_tx: mpsc::UnboundedSender<CompletedChunk>,
    cancel_tx: watch::Sender<bool>,
}

impl MediaAsset {
    /// Build the asset and spawn its coordinator. Must run inside a tokio
    /// runtime; readers may then live on any thread.
    pub(crate) fn start(
        label: String,
        format: AudioFormat,
        file_id: FileId,
        key: AudioKey,
        downloader: Arc<Downloader>,
        config: &StreamConfig,
    ) -> Arc<MediaAsset> {
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        let (chunk_change, _) = watch::channel(());
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let asset = Arc::new_cyclic(|weak| MediaAsset {
            weak_self: weak.clone(),
            label,
            media_type: format.media_type(),
            file_id,
            cipher: ChunkCipher::new(key.as_bytes().to_vec()),
            data_start_offset: format.header_skip(),
            resident_limit: config.resident_chunk_limit(),
            read_ahead: config.read_ahead,
            max_concurrent_fetches: config.max_concurrent_fetches,
            downloader,
            runtime: tokio::runtime::Handle::current(),
            state: Mutex::new(AssetState {
                chunks: HashMap::new(),
                total_bytes: 0,
                final_chunk: 0,
                latest_read: 0,
                in_flight: 0,
                access_counter: 0,
                fatal: None,
            }),
            chunk_change,
            completed_tx,
            cancel_tx,
        });

        tokio::spawn(MediaAsset::run(
            Arc::clone(&asset),
            completed_rx,
            cancel_rx,
        ));
        asset
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn media_type(&self) -> &str {
        self.media_type
    }

    pub fn stats(&self) -> AssetStats {
        let state = self.state.lock().unwrap();
        AssetStats {
            total_bytes: state.total_bytes,
            resident_chunks: state
                .chunks
                .values()
                .filter(|slot| matches!(slot, ChunkSlot::Ready { .. }))
                .count(),
            in_flight: state.in_flight,
        }
    }

    pub(crate) fn data_start_offset(&self) -> u64 {
        self.data_start_offset
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.state.lock().unwrap().total_bytes
    }

    /// Look up one chunk, blocking until it is decrypted and readable.
    ///
    /// The returned handle pins the chunk against eviction until dropped.
    /// Fails with `Eof` once the file size is known and the index lies past
    /// the final chunk, or with the asset's sticky fatal error.
    pub async fn read_chunk(&self, index: u32) -> Result<ChunkHandle, AssetError> {
        let mut change_rx = self.chunk_change.subscribe();
        loop {
            let fetch = {
                let mut state = self.state.lock().unwrap();
                if let Some(err) = &state.fatal {
                    return Err(err.clone());
                }
                if state.total_bytes > 0 && index > state.final_chunk {
                    return Err(AssetError::Eof);
                }
                state.latest_read = index;
                if let Some(handle) = self.try_pin(&mut state, index) {
                    return Ok(handle);
                }
                self.pick_fetch(&mut state)
            };

            if let Some(next) = fetch {
                if let Err(err) = self.start_fetch(next).await {
                    self.fail(err.clone());
                    return Err(err);
                }
                continue;
            }

            // Wait for the next publication or failure broadcast.
            if change_rx.changed().await.is_err() {
                return Err(AssetError::Cancelled);
            }
        }
    }

    /// Terminal, one-shot shutdown. Blocked readers wake with `Cancelled`
    /// and the coordinator quiesces.
    pub fn cancel(&self) {
        self.fail(AssetError::Cancelled);
    }

    /// Record the first fatal error, wake every blocked reader and stop the
    /// coordinator. Later errors are dropped; the first one is sticky.
    pub(crate) fn fail(&self, err: AssetError) {
        {
            let mut state = self.state.lock().unwrap();
            if state.fatal.is_some() {
                return;
            }
            if !matches!(err, AssetError::Cancelled) {
                warn!(label = %self.label, %err, "asset failed");
            }
            state.fatal = Some(err);
        }
        let _ = self.cancel_tx.send(true);
        self.chunk_change.send_replace(());
    }

    /// Queue a fully received, still-encrypted chunk for the coordinator.
    pub(crate) fn chunk_received(&self, index: u32, data: Vec<u8>, total_bytes: Option<u64>) {
        let _ = self.completed_tx.send(CompletedChunk {
            index,
            data,
            total_bytes,
        });
    }

    /// Coordinator loop. Consumes completed chunks until cancellation or a
    /// fatal error, then drops this asset's downloader registrations.
    async fn run(
        self: Arc<MediaAsset>,
        mut completed_rx: mpsc::UnboundedReceiver<CompletedChunk>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        debug!(label = %self.label, "asset coordinator started");
        loop {
            tokio::select! {
                chunk = completed_rx.recv() => match chunk {
                    Some(chunk) => {
                        if let Err(err) = self.publish_chunk(chunk).await {
                            self.fail(err);
                            break;
                        }
                    }
                    None => break,
                },
                _ = cancel_rx.changed() => break,
            }
        }
        self.downloader.drop_channels_for(&self.weak_self);
        debug!(label = %self.label, "asset coordinator stopped");
    }

    /// Decrypt and publish one completed chunk, then reschedule read-ahead
    /// and run eviction. The asset lock is never held across decryption.
    async fn publish_chunk(&self, chunk: CompletedChunk) -> Result<(), AssetError> {
        let CompletedChunk {
            index,
            mut data,
            total_bytes,
        } = chunk;

        {
            let mut state = self.state.lock().unwrap();
            if state.fatal.is_some() {
                return Ok(());
            }
            match state.chunks.get_mut(&index) {
                Some(slot) if matches!(slot, ChunkSlot::InFlight { .. }) => {
                    *slot = ChunkSlot::ReceivedEncrypted;
                }
                _ => {
                    warn!(index, "completion for a chunk that is not in flight");
                    return Ok(());
                }
            }
            state.in_flight = state.in_flight.saturating_sub(1);
            if let Some(total) = total_bytes {
                // The size only actually changes when the first chunk of the
                // file arrives. It must be visible before the broadcast below
                // so woken readers observe a consistent final chunk.
                if total != state.total_bytes {
                    state.total_bytes = total;
                    state.final_chunk = codec::chunk_index_at(total);
                    debug!(
                        label = %self.label,
                        total_bytes = total,
                        final_chunk = state.final_chunk,
                        "learned file size"
                    );
                }
            }
        }

        self.cipher.decrypt_chunk(index, &mut data)?;

        let fetch = {
            let mut state = self.state.lock().unwrap();
            trace!(index, len = data.len(), "chunk ready");
            state.chunks.insert(
                index,
                ChunkSlot::Ready {
                    data: Arc::new(data),
                    access_stamp: 0,
                    readers: 0,
                },
            );
            let fetch = self.pick_fetch(&mut state);
            self.evict_if_needed(&mut state);
            fetch
        };

        if let Some(next) = fetch {
            self.start_fetch(next).await?;
        }
        self.chunk_change.send_replace(());
        Ok(())
    }

    /// Pin and return the chunk when it is Ready.
    fn try_pin(&self, state: &mut AssetState, index: u32) -> Option<ChunkHandle> {
        if !matches!(state.chunks.get(&index), Some(ChunkSlot::Ready { .. })) {
            return None;
        }
        let asset = self.weak_self.upgrade()?;
        state.access_counter += 1;
        let stamp = state.access_counter;
        let Some(ChunkSlot::Ready {
            data,
            access_stamp,
            readers,
        }) = state.chunks.get_mut(&index)
        else {
            return None;
        };
        *access_stamp = stamp;
        *readers += 1;
        Some(ChunkHandle {
            asset,
            index,
            data: Arc::clone(data),
        })
    }

    /// Pick the next chunk to fetch, marking it in flight.
    ///
    /// Scans the read-ahead window for the leftmost hole so the earliest gap
    /// ahead of the reader fills first. While the file size is unknown the
    /// window collapses to the requested chunk itself. At most one fetch is
    /// started per call and the concurrency cap is honored.
    fn pick_fetch(&self, state: &mut AssetState) -> Option<u32> {
        if state.fatal.is_some() || state.in_flight >= self.max_concurrent_fetches {
            return None;
        }
        let lo = state.latest_read;
        let hi = if state.total_bytes > 0 {
            state
                .final_chunk
                .min(lo.saturating_add(self.read_ahead))
        } else {
            lo
        };
        for index in lo..=hi {
            if !state.chunks.contains_key(&index) {
                state.in_flight += 1;
                state
                    .chunks
                    .insert(index, ChunkSlot::InFlight { channel_id: 0 });
                return Some(index);
            }
        }
        None
    }

    /// Send the request for a chunk claimed by `pick_fetch`. No lock is held
    /// across the transport send.
    async fn start_fetch(&self, index: u32) -> Result<(), AssetError> {
        match self
            .downloader
            .request_chunk(self.weak_self.clone(), &self.file_id, index)
            .await
        {
            Ok(channel_id) => {
                let mut state = self.state.lock().unwrap();
                if let Some(ChunkSlot::InFlight { channel_id: id }) = state.chunks.get_mut(&index)
                {
                    *id = channel_id;
                }
                Ok(())
            }
            Err(err) => {
                let mut state = self.state.lock().unwrap();
                if matches!(state.chunks.get(&index), Some(ChunkSlot::InFlight { .. })) {
                    state.chunks.remove(&index);
                    state.in_flight = state.in_flight.saturating_sub(1);
                }
                Err(err.into())
            }
        }
    }

    /// Evict stale chunks while the Ready population exceeds the resident
    /// limit. Pinned chunks and the read-ahead window are never touched, so
    /// the limit is soft: when no candidate survives the vetoes the cache is
    /// left over budget.
    fn evict_if_needed(&self, state: &mut AssetState) {
        loop {
            let resident = state
                .chunks
                .values()
                .filter(|slot| matches!(slot, ChunkSlot::Ready { .. }))
                .count();
            if resident <= self.resident_limit {
                return;
            }
            let window_lo = state.latest_read;
            let window_hi = state.latest_read.saturating_add(self.read_ahead);
            let victim = state
                .chunks
                .iter()
                .filter_map(|(index, slot)| match slot {
                    ChunkSlot::Ready {
                        readers: 0,
                        access_stamp,
                        ..
                    } if *index < window_lo || *index > window_hi => {
                        Some((*index, *access_stamp))
                    }
                    _ => None,
                })
                .min_by_key(|&(_, stamp)| stamp)
                .map(|(index, _)| index);
            match victim {
                Some(index) => {
                    state.chunks.remove(&index);
                    trace!(index, "evicted chunk");
                }
                None => {
                    trace!(
                        resident,
                        limit = self.resident_limit,
                        "over resident limit with nothing evictable"
                    );
                    return;
                }
            }
        }
    }

    fn release_chunk(&self, index: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(ChunkSlot::Ready { readers, .. }) = state.chunks.get_mut(&index) {
            *readers = readers.saturating_sub(1);
        }
    }
}

/// A pinned, decrypted chunk.
///
/// The chunk cannot be evicted while the handle lives; dropping it releases
/// the pin. The data is shared and read-only.
pub struct ChunkHandle {
    asset: Arc<MediaAsset>,
    index: u32,
    data: Arc<Vec<u8>>,
}

impl std::fmt::Debug for ChunkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkHandle")
            .field("index", &self.index)
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl ChunkHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for ChunkHandle {
    fn drop(&mut self) {
        self.asset.release_chunk(self.index);
    }
}
