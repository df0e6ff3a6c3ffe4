pub mod database;
pub mod memory;
pub mod pg_store;
pub mod repositories;
pub mod store;

pub use database::DatabaseClient;
pub use memory::MemoryStore;
pub use pg_store::PgStore;
pub use repositories::{
    BatchRepository, CandleRepository, GapRepository, MetricRepository, PgBanStore, Repositories,
};
pub use store::{plan_enqueue, EnqueuePlan, GapQueue, MarketStore, UpsertOutcome};
