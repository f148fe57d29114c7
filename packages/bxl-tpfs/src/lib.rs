//! The Two-Phase Fingerprint Store (§4.2).

pub mod local;
pub mod remote;
pub mod server;
pub mod store;

pub use local::LocalTpfs;
pub use remote::RemoteTpfs;
pub use store::{EntryLookup, PublishMode, PublishResult, Store, TpfsCandidate};
