//! Session supervision: process lifecycle, the shared-store index,
//! heartbeats, and staleness reclamation.

pub mod events;
pub mod health;
pub mod record;
pub mod store;
pub mod supervisor;

pub use events::{
    HealthSnapshot, OutputEvent, OutputEventType, SessionNotification, SessionSubscription,
};
pub use health::{HealthMonitor, HealthMonitorConfig};
pub use record::{SessionRecord, SessionStatus};
pub use store::{SessionStore, SessionStoreConfig};
pub use supervisor::{SessionHandle, SessionSupervisor, SupervisorConfig};
