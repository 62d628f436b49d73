use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::StreamConfig;
use crate::downloader::Downloader;
use crate::protocol::{cmd, PacketTransport};
use crate::registry::{AssetRegistry, TrackCatalog};

/// Streaming half of a connected session.
///
/// Wires an established packet transport to the downloader and the asset
/// registry and runs the inbound packet pump. Login and the handshake that
/// produce the transport happen in the layer above; when the transport dies
/// the pump fails every pending request and exits, and that layer may build
/// a new `Session` on a fresh connection.
pub struct Session {
    downloader: Arc<Downloader>,
    registry: AssetRegistry,
    pump: JoinHandle<()>,
}

impl Session {
    /// Spawn the packet pump and set up the registry. Must run inside a
    /// tokio runtime.
    pub fn start(
        transport: Arc<dyn PacketTransport>,
        catalog: Arc<dyn TrackCatalog>,
        config: StreamConfig,
    ) -> Session {
        let downloader = Arc::new(Downloader::new(Arc::clone(&transport)));
        let registry = AssetRegistry::new(Arc::clone(&downloader), catalog, config);
        let pump = tokio::spawn(run_packet_pump(transport, Arc::clone(&downloader)));
        Session {
            downloader,
            registry,
            pump,
        }
    }

    pub fn registry(&self) -> &AssetRegistry {
        &self.registry
    }

    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.downloader
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Routes every inbound packet until the transport fails.
async fn run_packet_pump(transport: Arc<dyn PacketTransport>, downloader: Arc<Downloader>) {
    loop {
        match transport.recv_packet().await {
            Ok((code, payload)) => match code {
                cmd::PING => {
                    // Keepalive; the reply echoes the payload.
                    if let Err(err) = transport.send_packet(cmd::PONG, &payload).await {
                        warn!(%err, "failed to answer ping");
                        downloader.fail(err);
                        break;
                    }
                }
                cmd::PONG_ACK => {}
                cmd::COUNTRY_CODE => {
                    debug!(country = %String::from_utf8_lossy(&payload), "country code")
                }
                cmd::AES_KEY | cmd::AES_KEY_ERROR | cmd::STREAM_CHUNK_RES => {
                    downloader.handle_cmd(code, &payload)
                }
                other => trace!("unhandled command {:#04x}", other),
            },
            Err(err) => {
                warn!(%err, "packet stream ended");
                downloader.fail(err);
                break;
            }
        }
    }
}
