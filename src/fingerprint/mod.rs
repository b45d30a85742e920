/// Fingerprint derivation from validated events
pub mod fingerprinter;
pub mod normalise;

pub use fingerprinter::{stable_hash64, Fingerprint, Fingerprinter, DEFAULT_MAX_FRAMES};
pub use normalise::{frame_shape, normalise_message};
