//! Storage backends implementing [`skein_core::store::WorkflowStore`].

mod memory;
mod migrations;
mod postgres;

pub use memory::MemoryStore;
pub use migrations::{builtin_migrations, Migration, MigrationRunner};
pub use postgres::PgStore;
