//! Identifier and payload types shared across the core.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for a queued generation request.
///
/// Uses a short, readable format like "ent_abc123xy" instead of full UUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Create a new random entry ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Convert to a short, readable string format.
    pub fn to_short_string(&self) -> String {
        let hex = format!("{:032x}", self.0.as_u128());
        format!("ent_{}", &hex[..8])
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for EntryId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_short_string())
    }
}

/// A unique identifier for one collected batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(Uuid);

impl BatchId {
    /// Create a new random batch ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Convert to a short, readable string format.
    pub fn to_short_string(&self) -> String {
        let hex = format!("{:032x}", self.0.as_u128());
        format!("batch_{}", &hex[..8])
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for BatchId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_short_string())
    }
}

/// A generation request as submitted by the command layer.
///
/// The core treats the payload as opaque and forwards it unmodified to the
/// backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationPayload {
    /// Stable identifier of the requesting user
    pub user_id: String,

    /// Text prompt forwarded verbatim to the backend
    pub prompt: String,

    /// Optional source image for edit/compose style requests
    pub source_image: Option<Vec<u8>>,
}

impl GenerationPayload {
    /// Create a prompt-only payload.
    pub fn new(user_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            prompt: prompt.into(),
            source_image: None,
        }
    }

    /// Attach a source image for edit-style requests.
    pub fn with_source_image(mut self, image: Vec<u8>) -> Self {
        self.source_image = Some(image);
        self
    }
}

/// The product of a generation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOutput {
    /// Encoded image bytes
    pub image: Vec<u8>,

    /// MIME type of the encoded image (e.g., "image/png")
    pub mime_type: String,
}

impl GenerationOutput {
    /// Convenience constructor for PNG output.
    pub fn png(image: Vec<u8>) -> Self {
        Self {
            image,
            mime_type: "image/png".to_string(),
        }
    }
}
