mod batches;
mod cache;
mod chunks;
mod connection;
mod documents;
mod queries;
mod schema;
mod spaces;
mod usage;
mod versions;

pub use chunks::StoredChunk;
pub use connection::{DbError, KbDb, Result};
pub use queries::RETRIEVAL_TEST_HISTORY;
pub use schema::points_schema;
pub use usage::UsageRecord;
