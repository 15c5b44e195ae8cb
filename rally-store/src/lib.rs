pub mod app_config;
pub mod database;
pub mod events;
pub mod ledger_repo;
pub mod memory_repo;
pub mod redis_repo;
pub mod stripe_client;

pub use database::DbClient;
pub use events::EventProducer;
pub use ledger_repo::PgLedger;
pub use memory_repo::InMemoryLedger;
pub use redis_repo::RedisClient;
pub use stripe_client::StripeGateway;
