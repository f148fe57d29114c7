//! Path Set & Observed Inputs (§4.3) and the Fingerprinter (§4.4).

pub mod fingerprinter;
pub mod pathset;
pub mod stable_hash;

pub use fingerprinter::{FingerprintTrace, Fingerprinter, WeakFingerprintInputs};
pub use pathset::{canonicalize, path_set_hash};
