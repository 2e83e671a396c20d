//! Durable message storage for the relayq queue engine: the `MessageStore`
//! contract, a Postgres-backed implementation built on `FOR UPDATE SKIP
//! LOCKED`, an in-memory test double for scenario tests, and the embedded
//! schema migrator.

pub mod inmemory;
pub mod migration;
pub mod postgres;
pub mod store;

pub use inmemory::InMemoryMessageStore;
pub use migration::{create_initial_migrations, Migration, MigrationStatus, Migrator};
pub use postgres::PostgresMessageStore;
pub use store::{MessageStore, SortOrder};
