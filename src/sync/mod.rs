//! Background work: draining the outbox and refreshing the active generation.

mod dispatcher;
mod refresh;
mod remote;

pub use dispatcher::{DrainOutcome, DrainReport, DrainTrigger, SyncDispatcher};
pub use refresh::{refresh_generation, RefreshReport};
pub use remote::{HttpRemote, Remote};
