//! Database repositories for the model catalog.

mod diesel_model;
mod diesel_pool;

pub use diesel_model::ModelRepository;
pub use diesel_pool::{
    create_pool, create_pool_from_url, run_blocking, DieselError, PooledConn, R2D2Error,
    SqlitePool,
};

use chrono::{DateTime, Utc};

/// Parse an RFC 3339 timestamp from the database, falling back to the epoch
/// for unparseable values rather than failing the whole row.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
