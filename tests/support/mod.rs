// Shared helpers for integration tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use vireo::codec::{ChunkCipher, CHUNK_BYTES, CHUNK_WORDS};
use vireo::config::StreamConfig;
use vireo::model::{AudioFormat, AudioKey, AudioVariant, FileId, TrackId, TrackInfo};
use vireo::protocol::{cmd, PacketTransport, TransportError, TOTAL_SIZE_HEADER};
use vireo::registry::{CatalogError, TrackCatalog};
use vireo::Session;

/// Initialize tracing for tests with proper test output handling
pub fn tracing_init() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_target(false)
        .try_init();
}

/// Data packets from the mock server are split at this size to exercise
/// multi-packet accumulation per channel.
const DATA_PACKET_BYTES: usize = 50000;

struct ServedFile {
    key: AudioKey,
    plaintext: Vec<u8>,
}

type InboundPacket = Result<(u8, Vec<u8>), TransportError>;

/// In-memory stand-in for the encrypted packet stream.
///
/// Answers key and chunk requests the way the real server does: a header
/// packet carrying the total-size record, data packets with the AES-CTR
/// ciphertext of the requested chunk, and an empty end-of-channel packet.
/// Records every chunk request for assertions and supports stalling chunks
/// and breaking the connection.
pub struct MockTransport {
    files: StdMutex<HashMap<FileId, ServedFile>>,
    inbound_tx: mpsc::UnboundedSender<InboundPacket>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<InboundPacket>>,
    chunk_requests: StdMutex<Vec<(FileId, u32)>>,
    stalled: StdMutex<HashSet<u32>>,
    pongs: StdMutex<Vec<Vec<u8>>>,
    broken: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<MockTransport> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(MockTransport {
            files: StdMutex::new(HashMap::new()),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            chunk_requests: StdMutex::new(Vec::new()),
            stalled: StdMutex::new(HashSet::new()),
            pongs: StdMutex::new(Vec::new()),
            broken: AtomicBool::new(false),
        })
    }

    /// Serve a file under the given key.
    pub fn add_file(&self, file_id: FileId, key: AudioKey, plaintext: Vec<u8>) {
        self.files
            .lock()
            .unwrap()
            .insert(file_id, ServedFile { key, plaintext });
    }

    /// Every chunk request observed so far, as (file, chunk index) pairs.
    pub fn chunk_requests(&self) -> Vec<(FileId, u32)> {
        self.chunk_requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, file_id: &FileId) -> Vec<u32> {
        self.chunk_requests()
            .into_iter()
            .filter(|(file, _)| file == file_id)
            .map(|(_, index)| index)
            .collect()
    }

    /// Stop answering requests for one chunk index (across all files).
    pub fn stall_chunk(&self, index: u32) {
        self.stalled.lock().unwrap().insert(index);
    }

    /// Simulate the connection dying: sends fail and the pump sees an error.
    pub fn break_connection(&self) {
        self.broken.store(true, Ordering::SeqCst);
        let _ = self
            .inbound_tx
            .send(Err(TransportError::Failed("connection reset".to_string())));
    }

    /// Inject an arbitrary inbound packet (for pump-level tests).
    pub fn push_packet(&self, code: u8, payload: Vec<u8>) {
        let _ = self.inbound_tx.send(Ok((code, payload)));
    }

    /// Pong payloads the client sent back.
    pub fn pongs(&self) -> Vec<Vec<u8>> {
        self.pongs.lock().unwrap().clone()
    }

    fn answer_key_request(&self, payload: &[u8]) {
        let mut file_id = [0u8; 20];
        file_id.copy_from_slice(&payload[0..20]);
        let seq = &payload[36..40];

        let key = self
            .files
            .lock()
            .unwrap()
            .get(&FileId(file_id))
            .map(|file| file.key);
        match key {
            Some(key) => {
                let mut response = seq.to_vec();
                response.extend_from_slice(key.as_bytes());
                response.extend_from_slice(&[0, 0]);
                self.push_packet(cmd::AES_KEY, response);
            }
            None => {
                let mut response = seq.to_vec();
                response.extend_from_slice(&[0x00, 0x01]);
                self.push_packet(cmd::AES_KEY_ERROR, response);
            }
        }
    }

    fn answer_chunk_request(&self, payload: &[u8]) {
        let channel = &payload[0..2];
        let mut file_id = [0u8; 20];
        file_id.copy_from_slice(&payload[10..30]);
        let file_id = FileId(file_id);
        let start_word =
            u32::from_be_bytes([payload[30], payload[31], payload[32], payload[33]]);
        let chunk_index = start_word / CHUNK_WORDS as u32;

        self.chunk_requests
            .lock()
            .unwrap()
            .push((file_id, chunk_index));

        if self.stalled.lock().unwrap().contains(&chunk_index) {
            return;
        }

        let (key, total, ciphertext) = {
            let files = self.files.lock().unwrap();
            let Some(file) = files.get(&file_id) else {
                return;
            };
            let start = (start_word as usize) * 4;
            let end = (start + CHUNK_BYTES).min(file.plaintext.len());
            let slice = if start < file.plaintext.len() {
                file.plaintext[start..end].to_vec()
            } else {
                Vec::new()
            };
            (file.key, file.plaintext.len(), slice)
        };

        let mut ciphertext = ciphertext;
        let cipher = ChunkCipher::new(key.as_bytes().to_vec());
        cipher
            .encrypt_chunk(chunk_index, &mut ciphertext)
            .expect("fixture encryption");

        // Header packet: one unrelated record, then the total size in words.
        let mut header = channel.to_vec();
        header.extend_from_slice(&4u16.to_be_bytes());
        header.push(0x07);
        header.extend_from_slice(&[0, 0, 0]);
        header.extend_from_slice(&5u16.to_be_bytes());
        header.push(TOTAL_SIZE_HEADER);
        header.extend_from_slice(&((total / 4) as u32).to_be_bytes());
        self.push_packet(cmd::STREAM_CHUNK_RES, header);

        // Data packets, split to exercise accumulation.
        for piece in ciphertext.chunks(DATA_PACKET_BYTES) {
            let mut packet = channel.to_vec();
            packet.extend_from_slice(piece);
            self.push_packet(cmd::STREAM_CHUNK_RES, packet);
        }

        // Empty body ends the channel.
        self.push_packet(cmd::STREAM_CHUNK_RES, channel.to_vec());
    }
}

#[async_trait]
impl PacketTransport for MockTransport {
    async fn send_packet(&self, code: u8, payload: &[u8]) -> Result<(), TransportError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        match code {
            cmd::REQUEST_KEY => self.answer_key_request(payload),
            cmd::STREAM_CHUNK => self.answer_chunk_request(payload),
            cmd::PONG => self.pongs.lock().unwrap().push(payload.to_vec()),
            _ => {}
        }
        Ok(())
    }

    async fn recv_packet(&self) -> Result<(u8, Vec<u8>), TransportError> {
        let mut inbound = self.inbound_rx.lock().await;
        match inbound.recv().await {
            Some(packet) => packet,
            None => Err(TransportError::Closed),
        }
    }
}

/// In-memory track catalog
pub struct MockCatalog {
    tracks: StdMutex<HashMap<TrackId, TrackInfo>>,
}

impl MockCatalog {
    pub fn new() -> Arc<MockCatalog> {
        Arc::new(MockCatalog {
            tracks: StdMutex::new(HashMap::new()),
        })
    }

    pub fn add_track(&self, track_id: TrackId, info: TrackInfo) {
        self.tracks.lock().unwrap().insert(track_id, info);
    }
}

#[async_trait]
impl TrackCatalog for MockCatalog {
    async fn track_info(&self, track_id: &TrackId) -> Result<TrackInfo, CatalogError> {
        self.tracks
            .lock()
            .unwrap()
            .get(track_id)
            .cloned()
            .ok_or(CatalogError::NotFound)
    }
}

/// Deterministic but non-repeating fixture payload
pub fn make_plaintext(len: usize) -> Vec<u8> {
    use rand::{RngCore, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(len as u64);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

/// One served track wired through a full session
pub struct Fixture {
    pub transport: Arc<MockTransport>,
    pub catalog: Arc<MockCatalog>,
    pub session: Session,
    pub track_id: TrackId,
    pub file_id: FileId,
    pub plaintext: Vec<u8>,
}

impl Fixture {
    pub fn new(len: usize, format: AudioFormat, config: StreamConfig) -> Fixture {
        tracing_init();

        let track_id = TrackId([0x11; 16]);
        let file_id = FileId([0x22; 20]);
        let key = AudioKey([0x33; 16]);
        let plaintext = make_plaintext(len);

        let transport = MockTransport::new();
        transport.add_file(file_id, key, plaintext.clone());

        let catalog = MockCatalog::new();
        catalog.add_track(
            track_id,
            TrackInfo {
                label: "test track".to_string(),
                variants: vec![AudioVariant { file_id, format }],
            },
        );

        let session = Session::start(transport.clone(), catalog.clone(), config);
        Fixture {
            transport,
            catalog,
            session,
            track_id,
            file_id,
            plaintext,
        }
    }

    pub async fn pin(&self) -> vireo::AssetHandle {
        self.session
            .registry()
            .pin_asset(&self.track_id, |variants| {
                (!variants.is_empty()).then_some(0)
            })
            .await
            .expect("pin asset")
    }
}
