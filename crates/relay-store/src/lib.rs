pub mod database;
pub mod error;
pub mod queries;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod store;

pub use database::Database;
pub use error::StoreError;
pub use queries::QueryRepo;
pub use sessions::SessionRepo;
pub use store::SessionStore;
