//! Database repositories for the market data store.
//!
//! Each repository provides typed access to one table with batch upserts
//! and time-range queries.

pub mod ban_repo;
pub mod batch_repo;
pub mod candle_repo;
pub mod gap_repo;
pub mod metric_repo;

pub use ban_repo::PgBanStore;
pub use batch_repo::BatchRepository;
pub use candle_repo::CandleRepository;
pub use gap_repo::GapRepository;
pub use metric_repo::MetricRepository;

use sqlx::PgPool;

/// Creates all repositories from a single database pool.
#[derive(Debug, Clone)]
pub struct Repositories {
    pub candles: CandleRepository,
    pub metrics: MetricRepository,
    pub gaps: GapRepository,
    pub bans: PgBanStore,
    pub batches: BatchRepository,
}

impl Repositories {
    /// Creates a new set of repositories from a database pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            candles: CandleRepository::new(pool.clone()),
            metrics: MetricRepository::new(pool.clone()),
            gaps: GapRepository::new(pool.clone()),
            bans: PgBanStore::new(pool.clone()),
            batches: BatchRepository::new(pool),
        }
    }
}
