use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use tracing::debug;

use super::{AssetError, ChunkHandle, MediaAsset};
use crate::codec;

/// Byte-oriented random-access reader over a `MediaAsset`.
///
/// Implements `Read` and `Seek` for use with decoder media streams. Reads
/// translate into chunk lookups on the asset and block until the backing
/// chunk is downloaded and decrypted. One chunk at a time is kept pinned as
/// the hot chunk; seeks are in logical coordinates, measured past the
/// container header the format skips.
pub struct AssetReader {
    asset: Option<Arc<MediaAsset>>,
    runtime: tokio::runtime::Handle,
    /// Absolute position in the encoded file, header included
    read_pos: u64,
    hot_chunk: Option<ChunkHandle>,
}

impl AssetReader {
    pub(crate) fn new(asset: Arc<MediaAsset>) -> Self {
        let runtime = asset.runtime.clone();
        AssetReader {
            asset: Some(asset),
            runtime,
            read_pos: 0,
            hot_chunk: None,
        }
    }

    /// Release the hot chunk and detach from the asset. Further calls fail.
    pub fn close(&mut self) {
        self.hot_chunk = None;
        self.asset = None;
    }

    /// Resolve a chunk lookup from a synchronous caller.
    ///
    /// Readers usually live on decoder threads with no runtime of their own;
    /// from a runtime worker the blocking section is isolated first.
    fn block_on_chunk(&self, asset: &Arc<MediaAsset>, index: u32) -> Result<ChunkHandle, AssetError> {
        match tokio::runtime::Handle::try_current() {
            Ok(_) => tokio::task::block_in_place(|| self.runtime.block_on(asset.read_chunk(index))),
            Err(_) => self.runtime.block_on(asset.read_chunk(index)),
        }
    }

    /// Pin the given chunk as the hot chunk, releasing the previous one.
    fn pin_chunk(&mut self, index: u32) -> Result<&ChunkHandle, AssetError> {
        let cached = self.hot_chunk.as_ref().map(ChunkHandle::index) == Some(index);
        if !cached {
            let asset = self.asset.clone().ok_or(AssetError::Closed)?;
            // Unpin first: holding the old chunk through a blocking wait
            // would veto its eviction the whole time.
            self.hot_chunk = None;
            let handle = self.block_on_chunk(&asset, index)?;
            return Ok(self.hot_chunk.insert(handle));
        }
        self.hot_chunk.as_ref().ok_or(AssetError::Closed)
    }
}

fn io_err(err: AssetError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

impl Read for AssetReader {
    /// Blocks until at least one byte is available, then copies as much as
    /// the hot chunks provide without further waiting. Returns `Ok(0)` only
    /// at end of stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let asset = match &self.asset {
            Some(asset) => Arc::clone(asset),
            None => return Err(io_err(AssetError::Closed)),
        };

        // Skip the container header on the first read.
        if self.read_pos < asset.data_start_offset() {
            self.read_pos = asset.data_start_offset();
        }

        let mut written = 0;
        while written < buf.len() {
            let index = codec::chunk_index_at(self.read_pos);
            let rel = (self.read_pos - codec::chunk_start(index)) as usize;

            let copied = match self.pin_chunk(index) {
                Ok(chunk) => {
                    let data = chunk.data();
                    let run = data.len().saturating_sub(rel).min(buf.len() - written);
                    if run > 0 {
                        buf[written..written + run].copy_from_slice(&data[rel..rel + run]);
                    }
                    run
                }
                Err(AssetError::Eof) => 0,
                Err(err) => {
                    if written > 0 {
                        // The sticky error resurfaces on the next call.
                        break;
                    }
                    return Err(io_err(err));
                }
            };

            if copied == 0 {
                // Exhausted the short chunk at the end of the stream.
                break;
            }
            self.read_pos += copied as u64;
            written += copied;
        }

        Ok(written)
    }
}

impl Seek for AssetReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let asset = match &self.asset {
            Some(asset) => Arc::clone(asset),
            None => return Err(io_err(AssetError::Closed)),
        };

        // The file size arrives with chunk 0's headers; pin it once so
        // end-relative seeks have something to work with.
        if self.hot_chunk.is_none() {
            self.pin_chunk(0).map_err(io_err)?;
        }

        let start = asset.data_start_offset();
        let total = asset.total_bytes();
        let target = match pos {
            SeekFrom::Start(offset) => start.saturating_add(offset) as i64,
            SeekFrom::End(offset) => total as i64 + offset,
            SeekFrom::Current(offset) => self.read_pos as i64 + offset,
        };
        self.read_pos = (target.max(0) as u64).clamp(start, total.max(start));

        debug!(
            pos = self.read_pos - start,
            total_bytes = total,
            "🔍 reader seek"
        );
        Ok(self.read_pos - start)
    }
}
