//! Image storage collaborators.
//!
//! The on-disk storage engine lives outside this crate. This module defines
//! the operations the coordinator needs from it, plus reference parsing.

mod reference;
mod store;

pub use reference::{resolve_output_reference, ImageReference, Transport};
pub use store::{HistoryEntry, ImageStore, StoredImage};

use sha2::{Digest, Sha256};

/// Returns the hex-encoded SHA-256 digest of `data`.
#[must_use]
pub fn content_digest(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}
