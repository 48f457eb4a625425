pub mod memory;
pub mod metaapi;
pub mod postgres;

pub use memory::{Fault, MemoryStore, StoreOp};
pub use metaapi::MetaApiClient;
pub use postgres::PostgresStore;
