//! Session lifecycle: restore on startup, keep tokens fresh, follow other
//! contexts, and tear everything down on logout.

pub mod cleanup;
pub mod hooks;
pub mod refresh;
pub mod rehydrate;
pub mod sync;

pub use cleanup::{CleanupCascade, CleanupOutcome};
pub use hooks::{LogNavigator, Navigator, Telemetry, TracingTelemetry};
pub use refresh::{RefreshPolicy, RefreshScheduler};
pub use rehydrate::RehydrationOutcome;
pub use sync::SyncAction;
