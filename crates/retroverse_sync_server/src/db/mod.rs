mod repo;
mod schema;
mod store;

pub use repo::UserRepo;
pub use schema::{init_data_store, init_database};
pub use store::SqliteDataService;
