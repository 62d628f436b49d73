use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::asset::{AssetError, MediaAsset};
use crate::codec::CHUNK_BYTES;
use crate::model::{AudioKey, FileId, TrackId};
use crate::protocol::{self, cmd, PacketTransport, TransportError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("key request rejected by server")]
    Rejected,
    #[error("malformed key response")]
    Malformed,
    #[error("transport failed during key fetch: {0}")]
    Transport(#[from] TransportError),
}

/// One outstanding chunk request.
///
/// Holds a weak asset reference so a cancelled asset cannot be kept alive by
/// its own in-flight downloads; orphaned responses are drained silently.
struct PendingChunk {
    asset: Weak<MediaAsset>,
    chunk_index: u32,
    data: Vec<u8>,
    got_header: bool,
    total_bytes: Option<u64>,
}

#[derive(Default)]
struct DownloaderState {
    channels: HashMap<u16, PendingChunk>,
    next_channel_id: u16,
    key_waiters: HashMap<u32, oneshot::Sender<Result<AudioKey, KeyError>>>,
    next_seq: u32,
    failed: Option<TransportError>,
}

/// Multiplexes chunk downloads and key requests over one packet transport.
///
/// Outbound requests are correlated with inbound packets by channel id
/// (chunks) or sequence number (keys). Completed chunks are handed to the
/// owning asset's coordinator; the downloader itself imposes no fetch
/// concurrency limit, that is the asset's job.
pub struct Downloader {
    transport: Arc<dyn PacketTransport>,
    state: Mutex<DownloaderState>,
}

impl Downloader {
    pub fn new(transport: Arc<dyn PacketTransport>) -> Self {
        Downloader {
            transport,
            state: Mutex::new(DownloaderState::default()),
        }
    }

    /// Send a request for one chunk and register the response channel.
    ///
    /// Returns the allocated channel id. The chunk data arrives later through
    /// `handle_cmd` and is delivered to the asset's coordinator.
    pub(crate) async fn request_chunk(
        &self,
        asset: Weak<MediaAsset>,
        file_id: &FileId,
        chunk_index: u32,
    ) -> Result<u16, TransportError> {
        let channel_id = {
            let mut state = self.state.lock().unwrap();
            if let Some(err) = &state.failed {
                return Err(err.clone());
            }
            // Wrap around, skipping ids still in use; reuse only after release.
            let mut id = state.next_channel_id;
            while state.channels.contains_key(&id) {
                id = id.wrapping_add(1);
            }
            state.next_channel_id = id.wrapping_add(1);
            state.channels.insert(
                id,
                PendingChunk {
                    asset,
                    chunk_index,
                    data: Vec::with_capacity(CHUNK_BYTES),
                    got_header: false,
                    total_bytes: None,
                },
            );
            id
        };

        debug!(channel_id, chunk_index, file = %file_id, "requesting chunk");
        let packet = protocol::build_chunk_request(channel_id, file_id, chunk_index);
        if let Err(err) = self.transport.send_packet(cmd::STREAM_CHUNK, &packet).await {
            self.state.lock().unwrap().channels.remove(&channel_id);
            return Err(err);
        }
        Ok(channel_id)
    }

    /// Fetch the audio key for a file, correlated by sequence number.
    pub async fn fetch_key(
        &self,
        track_id: &TrackId,
        file_id: &FileId,
    ) -> Result<AudioKey, KeyError> {
        let (tx, rx) = oneshot::channel();
        let seq = {
            let mut state = self.state.lock().unwrap();
            if let Some(err) = &state.failed {
                return Err(KeyError::Transport(err.clone()));
            }
            let seq = state.next_seq;
            state.next_seq = state.next_seq.wrapping_add(1);
            state.key_waiters.insert(seq, tx);
            seq
        };

        debug!(seq, file = %file_id, "requesting audio key");
        let packet = protocol::build_key_request(seq, track_id, file_id);
        if let Err(err) = self.transport.send_packet(cmd::REQUEST_KEY, &packet).await {
            self.state.lock().unwrap().key_waiters.remove(&seq);
            return Err(KeyError::Transport(err));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(KeyError::Transport(TransportError::Closed)),
        }
    }

    /// Route one inbound packet to the matching pending request.
    ///
    /// Commands outside the streaming set are ignored.
    pub fn handle_cmd(&self, code: u8, payload: &[u8]) {
        match code {
            cmd::AES_KEY => self.handle_key_response(payload),
            cmd::AES_KEY_ERROR => self.handle_key_error(payload),
            cmd::STREAM_CHUNK_RES => self.handle_chunk_response(payload),
            other => trace!("ignoring command {:#04x}", other),
        }
    }

    fn handle_key_response(&self, payload: &[u8]) {
        if payload.len() < 4 {
            warn!(len = payload.len(), "short key response");
            return;
        }
        let seq = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let Some(waiter) = self.state.lock().unwrap().key_waiters.remove(&seq) else {
            warn!(seq, "key response for unknown sequence");
            return;
        };
        if payload.len() < 20 {
            let _ = waiter.send(Err(KeyError::Malformed));
            return;
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(&payload[4..20]);
        let _ = waiter.send(Ok(AudioKey(key)));
    }

    fn handle_key_error(&self, payload: &[u8]) {
        if payload.len() < 4 {
            warn!(len = payload.len(), "short key error packet");
            return;
        }
        let seq = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        match self.state.lock().unwrap().key_waiters.remove(&seq) {
            Some(waiter) => {
                let _ = waiter.send(Err(KeyError::Rejected));
            }
            None => warn!(seq, "key error for unknown sequence"),
        }
    }

    fn handle_chunk_response(&self, payload: &[u8]) {
        if payload.len() < 2 {
            warn!(len = payload.len(), "short chunk response");
            return;
        }
        let channel_id = u16::from_be_bytes([payload[0], payload[1]]);
        let body = &payload[2..];

        let completed = {
            let mut state = self.state.lock().unwrap();
            let done = match state.channels.get_mut(&channel_id) {
                None => {
                    debug!(channel_id, "chunk data for unknown channel");
                    return;
                }
                Some(pending) => {
                    if !pending.got_header {
                        // The first packet of every channel carries the
                        // header records; data starts with the next packet.
                        pending.got_header = true;
                        for record in protocol::parse_header_records(body) {
                            if record.id == protocol::TOTAL_SIZE_HEADER {
                                match protocol::total_size_from_header(record.body) {
                                    Some(total) => pending.total_bytes = Some(total),
                                    None => warn!(channel_id, "malformed total-size header"),
                                }
                            }
                        }
                        false
                    } else if body.is_empty() {
                        // Empty body ends the channel.
                        true
                    } else {
                        pending.data.extend_from_slice(body);
                        false
                    }
                }
            };
            if done {
                state.channels.remove(&channel_id)
            } else {
                None
            }
        };

        if let Some(pending) = completed {
            trace!(
                channel_id,
                chunk_index = pending.chunk_index,
                len = pending.data.len(),
                "chunk complete"
            );
            match pending.asset.upgrade() {
                Some(asset) => {
                    asset.chunk_received(pending.chunk_index, pending.data, pending.total_bytes)
                }
                None => debug!(channel_id, "completed chunk for dropped asset"),
            }
        }
    }

    /// Tear down after a transport failure.
    ///
    /// Every key waiter and every pending chunk's asset observes the error;
    /// further requests are rejected.
    pub fn fail(&self, err: TransportError) {
        let (waiters, channels) = {
            let mut state = self.state.lock().unwrap();
            if state.failed.is_some() {
                return;
            }
            state.failed = Some(err.clone());
            (
                std::mem::take(&mut state.key_waiters),
                std::mem::take(&mut state.channels),
            )
        };

        warn!(
            %err,
            pending_chunks = channels.len(),
            pending_keys = waiters.len(),
            "transport failed, aborting pending requests"
        );
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(KeyError::Transport(err.clone())));
        }
        for (_, pending) in channels {
            if let Some(asset) = pending.asset.upgrade() {
                asset.fail(AssetError::Transport(err.clone()));
            }
        }
    }

    /// Drop the channel registrations belonging to one asset.
    ///
    /// Called by an asset's coordinator on shutdown so late responses for it
    /// are treated as unknown channels.
    pub(crate) fn drop_channels_for(&self, asset: &Weak<MediaAsset>) {
        let mut state = self.state.lock().unwrap();
        state
            .channels
            .retain(|_, pending| pending.asset.strong_count() > 0 && !Weak::ptr_eq(&pending.asset, asset));
    }
}
