//! In-memory cache of the platform's token verification keys.

pub mod entry;
pub mod manager;
pub mod refresher;
pub mod state;

pub use manager::{KeySetCache, KeySetStatus};
pub use refresher::RefresherHandle;
