// Streaming media asset cache: fixed-size chunks of encrypted audio fetched
// over a multiplexed packet channel, decrypted and cached per asset, exposed
// to decoders as a blocking Read + Seek byte stream.

pub mod asset;
pub mod codec;
pub mod config;
pub mod downloader;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod session;

// Re-export the main entry points at the crate root
pub use asset::{AssetError, AssetReader, AssetStats, ChunkHandle, MediaAsset};
pub use config::StreamConfig;
pub use registry::{AssetHandle, AssetRegistry, PinError, TrackCatalog};
pub use session::Session;
