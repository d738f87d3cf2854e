pub mod database;
pub mod error;
pub mod identities;
pub mod row_helpers;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use identities::{IdentityRepo, IdentityRow, PresenceWrite};
