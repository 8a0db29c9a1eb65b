//! Latest-frame cache and the background poller that feeds it

mod cache;
mod poller;

pub use cache::{NotReady, TelemetryCache, WaitError};
pub use poller::{BackgroundPoller, PollerHandle, PollerStats};
