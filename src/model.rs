use std::fmt;

/// Bytes of proprietary container header at the start of OGG-Vorbis files.
///
/// The server prepends a custom metadata packet that is not well-formed OGG;
/// readers skip it and expose the stream starting at the real Vorbis data.
pub const OGG_HEADER_SKIP: u64 = 0xa7;

/// 16-byte track identifier (the gid of a track)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackId(pub [u8; 16]);

impl TrackId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrackId({})", hex::encode(self.0))
    }
}

/// 20-byte identifier of one encoded file on the server
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub [u8; 20]);

impl FileId {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", hex::encode(self.0))
    }
}

/// 16-byte AES key protecting one encoded file
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AudioKey(pub [u8; 16]);

impl AudioKey {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for AudioKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs
        f.write_str("AudioKey([REDACTED])")
    }
}

/// Encodings a track can be served in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    OggVorbis96,
    OggVorbis160,
    OggVorbis320,
    Mp3_96,
    Mp3_160,
    Mp3_256,
    Mp3_320,
    Aac24,
    Aac48,
}

impl AudioFormat {
    /// Container header bytes to skip before the decodable stream starts.
    pub fn header_skip(&self) -> u64 {
        match self {
            AudioFormat::OggVorbis96 | AudioFormat::OggVorbis160 | AudioFormat::OggVorbis320 => {
                OGG_HEADER_SKIP
            }
            _ => 0,
        }
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            AudioFormat::OggVorbis96 | AudioFormat::OggVorbis160 | AudioFormat::OggVorbis320 => {
                "audio/ogg"
            }
            AudioFormat::Mp3_96 | AudioFormat::Mp3_160 | AudioFormat::Mp3_256
            | AudioFormat::Mp3_320 => "audio/mpeg",
            AudioFormat::Aac24 | AudioFormat::Aac48 => "audio/aac",
        }
    }
}

/// One downloadable encoding of a track
#[derive(Debug, Clone)]
pub struct AudioVariant {
    pub file_id: FileId,
    pub format: AudioFormat,
}

/// Metadata needed to stream a track, as returned by the catalog
#[derive(Debug, Clone)]
pub struct TrackInfo {
    /// Human-readable name, used for output naming
    pub label: String,
    pub variants: Vec<AudioVariant>,
}
