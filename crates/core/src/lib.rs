pub mod config;
pub mod config_loader;
pub mod error;
pub mod interval;
pub mod models;
pub mod traits;

pub use config::{
    AppConfig, BackfillConfig, DatabaseConfig, ExchangeConfig, MetricsConfig, RateLimitConfig,
    ScannerConfig, ShutdownConfig, StreamConfig, UniverseConfig,
};
pub use config_loader::ConfigLoader;
pub use error::{IngestError, IngestResult};
pub use interval::{from_millis, Interval};
pub use models::{
    BanState, Candle, ClaimFilter, DataSource, Dataset, GapDescriptor, GapRoute, GapStatus,
    IngestBatch, MetricSample,
};
pub use traits::{
    ArchiveFile, ArchivePeriod, ArchiveRows, ArchiveSource, BanStore, FrameStream, KlineStream,
    MarketDataRest, StreamFrame,
};
