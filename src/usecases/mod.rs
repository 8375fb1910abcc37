//! Application use cases. Orchestrate domain logic via ports.

pub mod coordinator;
pub mod distributor;
pub mod downloader;
pub mod fetcher;
pub mod grouper;
pub mod mirror_service;
pub mod publisher;
pub mod session_pool;
pub mod stats;
pub mod template;

pub use coordinator::{PublishUnit, UnitSink, UploadCoordinator};
pub use distributor::{distribute, DistributionSettings};
pub use downloader::{DownloadMode, DownloadOutcome, MediaDownloader};
pub use fetcher::MessageFetcher;
pub use grouper::group_messages;
pub use mirror_service::MirrorService;
pub use publisher::{PublisherSettings, StagedPublisher};
pub use session_pool::{PooledSession, SessionPool, SessionState};
pub use stats::{RunReport, StatsCollector};
pub use template::{TemplateDefinition, TemplateEngine, TemplateMode, VariableExtractor};
