use std::path::PathBuf;

use lancedb::{Connection, connect};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::db::schema::{
  batches_schema, chunks_schema, document_versions_schema, documents_schema, embedding_cache_schema,
  evaluation_datasets_schema, feedback_schema, query_records_schema, spaces_schema, usage_records_schema,
};

#[derive(Error, Debug)]
pub enum DbError {
  #[error("LanceDB error: {0}")]
  Lance(#[from] lancedb::Error),
  #[error("Arrow error: {0}")]
  Arrow(#[from] arrow::error::ArrowError),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Not found: {0}")]
  NotFound(String),
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
  #[error("Invalid input: {0}")]
  InvalidInput(String),
  #[error("Database query error: {0}")]
  Query(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Escape a value for interpolation into a LanceDB filter expression.
pub(in crate::db) fn escape(value: &str) -> String {
  value.replace('\'', "''")
}

/// Database connection for the engine's metadata tables.
///
/// Per-tenant vector collections live in the same LanceDB database but are
/// managed by the vector-store adapter.
pub struct KbDb {
  pub connection: Connection,
  pub vector_dim: usize,
}

impl KbDb {
  /// Open or create the database under `data_dir/lancedb`.
  pub async fn open(data_dir: &std::path::Path, vector_dim: usize) -> Result<Self> {
    let db_path = data_dir.join("lancedb");
    Self::open_at_path(db_path, vector_dim).await
  }

  /// Open database at a specific path
  pub async fn open_at_path(db_path: PathBuf, vector_dim: usize) -> Result<Self> {
    if let Some(parent) = db_path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }

    info!(path = %db_path.display(), vector_dim, "Opening database connection");
    let connection = match connect(db_path.to_string_lossy().as_ref()).execute().await {
      Ok(conn) => {
        debug!(path = %db_path.display(), "Database connection established");
        conn
      }
      Err(e) => {
        error!(path = %db_path.display(), err = %e, "Failed to connect to database");
        return Err(e.into());
      }
    };

    let db = Self { connection, vector_dim };

    debug!("Initializing database schema");
    db.ensure_tables().await?;

    Ok(db)
  }

  /// Ensure all required tables exist
  async fn ensure_tables(&self) -> Result<()> {
    let table_names = self.connection.table_names().execute().await?;
    debug!(existing_tables = table_names.len(), "Checking required tables");

    let required: &[(&str, std::sync::Arc<arrow_schema::Schema>)] = &[
      ("knowledge_spaces", spaces_schema()),
      ("documents", documents_schema()),
      ("chunks", chunks_schema()),
      ("document_versions", document_versions_schema()),
      ("batches", batches_schema()),
      ("embedding_cache", embedding_cache_schema(self.vector_dim)),
      ("query_records", query_records_schema()),
      ("feedback", feedback_schema()),
      ("usage_records", usage_records_schema()),
      ("evaluation_datasets", evaluation_datasets_schema()),
    ];

    for (name, schema) in required {
      if !table_names.contains(&name.to_string()) {
        debug!(table = name, "Creating table");
        self
          .connection
          .create_empty_table(*name, schema.clone())
          .execute()
          .await?;
      }
    }

    Ok(())
  }

  pub async fn documents_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table("documents").execute().await?)
  }

  pub async fn chunks_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table("chunks").execute().await?)
  }

  pub async fn document_versions_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table("document_versions").execute().await?)
  }

  pub async fn batches_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table("batches").execute().await?)
  }

  pub async fn embedding_cache_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table("embedding_cache").execute().await?)
  }

  pub async fn query_records_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table("query_records").execute().await?)
  }

  pub async fn feedback_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table("feedback").execute().await?)
  }

  pub async fn usage_records_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table("usage_records").execute().await?)
  }

  pub async fn evaluation_datasets_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table("evaluation_datasets").execute().await?)
  }
}
