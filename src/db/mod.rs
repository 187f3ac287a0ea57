mod connection;
mod query;
mod schema;
mod store;

pub use connection::{create_pool, ConnectionConfig, SslMode};
pub use query::*;
pub use schema::*;
pub use store::{PgStore, SqlStore};
