pub mod debounce;
pub mod history;
pub mod notifications;
pub mod read_tracker;
pub mod sync_engine;

pub use read_tracker::{AlwaysVisible, VisibilityProbe};
pub use sync_engine::{EngineUpdate, SyncEngine};
