pub mod masked;
pub mod models;

pub use masked::Masked;
pub use models::events::{SettlementEvent, UnitKind};
