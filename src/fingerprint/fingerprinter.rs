//! Error fingerprinting for grouping recurring errors.
//!
//! The fingerprint key is a SHA-256 hash computed from the normalised message,
//! the stack shape, the component and the route. It contains no randomness and
//! no wall-clock input, so the same logical error yields the same key across
//! restarts.

use crate::events::ErrorEvent;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::normalise::{frame_shape, normalise_message};

/// Default maximum number of stack frames to include in fingerprint.
pub const DEFAULT_MAX_FRAMES: usize = 5;

/// Identity of an error, derived from an `ErrorEvent`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub normalized_message: String,
    pub stack_shape_hash: String,
    pub component: String,
    pub route: Option<String>,
    /// Hex SHA-256 over the fields above
    pub key: String,
}

impl Fingerprint {
    /// First 64 bits of the key, for cardinality sketches
    pub fn hash64(&self) -> u64 {
        self.key
            .get(..16)
            .and_then(|prefix| u64::from_str_radix(prefix, 16).ok())
            .unwrap_or_else(|| stable_hash64(&self.key))
    }
}

/// Computes fingerprints from validated events
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    max_frames: usize,
}

impl Fingerprinter {
    pub fn new(max_frames: usize) -> Self {
        Self {
            max_frames: max_frames.max(1),
        }
    }

    /// Derive the fingerprint of an event
    ///
    /// Pure and deterministic: depends only on the event's message, stack
    /// frames, component and route.
    #[must_use]
    pub fn fingerprint(&self, event: &ErrorEvent) -> Fingerprint {
        const DELIMITER: &[u8] = b"\x00";

        let normalized_message = normalise_message(&event.message);
        let stack_shape_hash = self.stack_shape_hash(&event.stack_frames);
        let component = event.component.clone();
        let route = event.route.as_deref().map(normalise_message);

        let mut hasher = Sha256::new();
        hasher.update(normalized_message.as_bytes());
        hasher.update(DELIMITER);
        hasher.update(stack_shape_hash.as_bytes());
        hasher.update(DELIMITER);
        hasher.update(component.as_bytes());
        hasher.update(DELIMITER);
        if let Some(route) = &route {
            hasher.update(route.as_bytes());
        }
        let key = hex::encode(hasher.finalize());

        Fingerprint {
            normalized_message,
            stack_shape_hash,
            component,
            route,
            key,
        }
    }

    /// Hash of the first `max_frames` frame shapes; empty stacks hash to ""
    fn stack_shape_hash(&self, frames: &[String]) -> String {
        let shapes: Vec<String> = frames
            .iter()
            .filter(|frame| !frame.trim().is_empty())
            .take(self.max_frames)
            .map(|frame| frame_shape(frame))
            .collect();
        if shapes.is_empty() {
            return String::new();
        }
        let digest = Sha256::digest(shapes.join("|").as_bytes());
        hex::encode(&digest[..8])
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAMES)
    }
}

/// Stable 64-bit hash of a string, identical across processes and platforms
pub fn stable_hash64(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}
