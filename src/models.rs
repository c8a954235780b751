//! Domain models for the acquisition catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier for a model provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceId {
    #[serde(rename = "vroid_hub")]
    VroidHub,
    #[serde(rename = "sketchfab")]
    Sketchfab,
    #[serde(rename = "deviantart")]
    DeviantArt,
    #[serde(rename = "github")]
    GitHub,
}

impl SourceId {
    /// All providers, in default crawl order.
    pub const ALL: [SourceId; 4] = [
        SourceId::VroidHub,
        SourceId::Sketchfab,
        SourceId::DeviantArt,
        SourceId::GitHub,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::VroidHub => "vroid_hub",
            SourceId::Sketchfab => "sketchfab",
            SourceId::DeviantArt => "deviantart",
            SourceId::GitHub => "github",
        }
    }

    pub fn from_str(s: &str) -> Option<SourceId> {
        match s {
            "vroid_hub" => Some(SourceId::VroidHub),
            "sketchfab" => Some(SourceId::Sketchfab),
            "deviantart" => Some(SourceId::DeviantArt),
            "github" => Some(SourceId::GitHub),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cataloged acquisition.
///
/// The pair `(source, source_model_id)` is the sole deduplication key and is
/// unique across the catalog. Records are never overwritten once inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub source: SourceId,
    /// Provider-native identifier, unique within a source.
    pub source_model_id: String,
    pub name: String,
    #[serde(default)]
    pub artist: Option<String>,
    /// Canonical page the model came from.
    pub source_url: String,
    #[serde(default)]
    pub license_type: Option<String>,
    #[serde(default)]
    pub license_url: Option<String>,
    /// Set once, at successful completion of download + classification.
    pub acquired_at: DateTime<Utc>,
    /// Stored primary artifact, relative to the data root.
    pub file_path: String,
    /// Normalized lowercase extension/category: vrm, glb, gltf, zip, fbx, ...
    pub file_type: String,
    /// Format before extraction normalization, when different from `file_type`.
    #[serde(default)]
    pub original_format: Option<String>,
    pub size_bytes: u64,
    #[serde(default)]
    pub thumbnail_path: Option<String>,
    /// Free-text annotations: archive contents, conversion instructions,
    /// hint/sniff mismatches, payload checksum.
    #[serde(default)]
    pub notes: Vec<String>,
}
