//! Codec priority configuration.
//!
//! The protocol engine negotiates media encodings according to an ordered
//! table of (codec identifier, priority) pairs. Priorities range from 0
//! (disabled) to 254 (maximum); higher priorities sort first and ties keep
//! their existing order. The table is loaded from the persisted store at
//! startup, or falls back to [`default_table`] when nothing is persisted.

use serde::{Deserialize, Serialize};

/// Highest selectable priority for an audio codec.
pub const PRIORITY_MAX: u8 = 254;
/// Highest selectable priority for a video codec.
pub const PRIORITY_MAX_VIDEO: u8 = 128;
/// Lowest priority at which a codec is still enabled.
pub const PRIORITY_MIN: u8 = 1;
/// Priority value that disables a codec.
pub const PRIORITY_DISABLED: u8 = 0;

/// A codec identifier paired with its negotiation priority.
///
/// Codec identifiers follow the engine's `name/clockrate/channels` format,
/// e.g. `opus/48000/2` or `PCMU/8000/1`.
///
/// ```rust
/// use voxline_client_core::codec::{CodecPriority, PRIORITY_MAX};
///
/// let codec = CodecPriority::new("opus/48000/2", PRIORITY_MAX);
/// assert_eq!(codec.label(), "Opus");
/// assert_eq!(codec.sample_rate_khz(), Some(48));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecPriority {
    codec_id: String,
    priority: u8,
}

impl CodecPriority {
    /// Creates a new entry; the priority is clamped to `[0, 254]`.
    pub fn new(codec_id: impl Into<String>, priority: u8) -> Self {
        Self {
            codec_id: codec_id.into(),
            priority: priority.min(PRIORITY_MAX),
        }
    }

    /// The engine-level codec identifier (e.g. `PCMU/8000/1`).
    pub fn codec_id(&self) -> &str {
        &self.codec_id
    }

    /// Current priority, 0 meaning disabled.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Sets the priority, clamping to `[0, 254]`.
    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority.min(PRIORITY_MAX);
    }

    /// Whether this codec is disabled.
    pub fn is_disabled(&self) -> bool {
        self.priority == PRIORITY_DISABLED
    }

    /// Human readable codec label (e.g. `G.729` for `G729/8000/1`).
    pub fn label(&self) -> &str {
        let name = self.codec_id.split('/').next().unwrap_or(&self.codec_id);
        match name {
            "G729" => "G.729",
            "PCMU" => "PCMU",
            "PCMA" => "PCMA",
            "speex" => "Speex",
            "G722" => "G.722",
            "G7221" => "G.722.1",
            "opus" => "Opus",
            other => other,
        }
    }

    /// Sample rate in kHz parsed from the codec identifier, if present.
    pub fn sample_rate_khz(&self) -> Option<u32> {
        self.codec_id
            .split('/')
            .nth(1)
            .and_then(|rate| rate.parse::<u32>().ok())
            .map(|rate| rate / 1000)
    }
}

impl std::fmt::Display for CodecPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CodecID: {}, Priority: {}", self.codec_id, self.priority)
    }
}

/// Sorts a table so higher priorities come first; ties keep their order.
pub fn sort_descending(table: &mut [CodecPriority]) {
    table.sort_by(|a, b| b.priority.cmp(&a.priority));
}

/// The codec table applied when nothing has been persisted yet.
///
/// Opus is preferred, followed by the two PCM variants; every legacy codec
/// the engine may enumerate is explicitly disabled so negotiation stays
/// deterministic across engine versions.
pub fn default_table() -> Vec<CodecPriority> {
    vec![
        CodecPriority::new("opus/48000/2", PRIORITY_MAX),
        CodecPriority::new("PCMA/8000/1", PRIORITY_MAX - 1),
        CodecPriority::new("PCMU/8000/1", PRIORITY_MAX - 2),
        CodecPriority::new("G729/8000/1", PRIORITY_DISABLED),
        CodecPriority::new("speex/8000/1", PRIORITY_DISABLED),
        CodecPriority::new("speex/16000/1", PRIORITY_DISABLED),
        CodecPriority::new("speex/32000/1", PRIORITY_DISABLED),
        CodecPriority::new("GSM/8000/1", PRIORITY_DISABLED),
        CodecPriority::new("G722/16000/1", PRIORITY_DISABLED),
        CodecPriority::new("G7221/16000/1", PRIORITY_DISABLED),
        CodecPriority::new("G7221/32000/1", PRIORITY_DISABLED),
        CodecPriority::new("ilbc/8000/1", PRIORITY_DISABLED),
    ]
}
