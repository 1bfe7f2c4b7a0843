pub mod contexts;
pub mod database;
pub mod error;
pub mod row_helpers;
pub mod schema;
pub mod versions;

pub use contexts::SqliteContextStore;
pub use database::Database;
pub use error::StoreError;
pub use versions::SqliteVersionLog;
