//! Output line classification, tenancy-tagged stream publishing, and the
//! bounded per-session replay history.

pub mod backend;
pub mod events;
pub mod history;
pub mod parser;
pub mod publisher;

pub use backend::{InMemoryPublishBackend, PublishBackend, RedisPublishBackend};
pub use events::{
    ChangeType, OutputKind, StreamEvent, StreamEventMetadata, StreamEventType, TestStatus,
    TestSummary,
};
pub use history::{HistoryBuffer, HistoryConfig};
pub use parser::{classify_line, Classification};
pub use publisher::{PublisherConfig, PublisherMetrics, StreamPublisher};
