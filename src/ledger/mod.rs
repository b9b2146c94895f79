pub mod memory;
pub mod models;
pub mod repository;
pub mod store;

pub use memory::InMemoryLedger;
pub use repository::PgLedgerRepository;
pub use store::{
    AccountDirectory, ContractDirectory, LedgerStore, LedgerWrite, ReconcileStore, SettlementStore,
    UnitOfWork, WebhookClaim,
};
