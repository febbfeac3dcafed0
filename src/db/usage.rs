// Usage accounting rows for streamed chats. Persistence is best-effort:
// callers log and continue on failure.

use arrow_array::{BooleanArray, Float64Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt64Array};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  db::{
    connection::{KbDb, Result},
    schema::usage_records_schema,
  },
  domain::tenant::TenantId,
};

/// One streamed-chat usage row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
  pub tenant_id: TenantId,
  pub organization_id: Option<String>,
  pub conversation_id: Option<String>,
  pub endpoint: String,
  pub model_alias: String,
  pub input_tokens: u64,
  pub output_tokens: u64,
  pub total_tokens: u64,
  pub response_time_ms: f64,
  pub success: bool,
}

impl KbDb {
  /// Persist one usage row.
  #[tracing::instrument(level = "trace", skip(self, record), fields(tenant = %record.tenant_id))]
  pub async fn add_usage_record(&self, record: &UsageRecord) -> Result<()> {
    let table = self.usage_records_table().await?;

    let batch = RecordBatch::try_new(
      usage_records_schema(),
      vec![
        std::sync::Arc::new(StringArray::from(vec![Uuid::new_v4().to_string()])),
        std::sync::Arc::new(UInt64Array::from(vec![record.tenant_id.as_u64()])),
        std::sync::Arc::new(StringArray::from(vec![record.organization_id.clone()])),
        std::sync::Arc::new(StringArray::from(vec![record.conversation_id.clone()])),
        std::sync::Arc::new(StringArray::from(vec![record.endpoint.clone()])),
        std::sync::Arc::new(StringArray::from(vec![record.model_alias.clone()])),
        std::sync::Arc::new(UInt64Array::from(vec![record.input_tokens])),
        std::sync::Arc::new(UInt64Array::from(vec![record.output_tokens])),
        std::sync::Arc::new(UInt64Array::from(vec![record.total_tokens])),
        std::sync::Arc::new(Float64Array::from(vec![record.response_time_ms])),
        std::sync::Arc::new(BooleanArray::from(vec![record.success])),
        std::sync::Arc::new(Int64Array::from(vec![chrono::Utc::now().timestamp_millis()])),
      ],
    )?;

    let batches = RecordBatchIterator::new(vec![Ok(batch)], usage_records_schema());
    table.add(Box::new(batches)).execute().await?;
    Ok(())
  }

  /// Usage rows recorded for a tenant.
  pub async fn count_usage_records(&self, tenant: TenantId) -> Result<usize> {
    let table = self.usage_records_table().await?;
    Ok(table.count_rows(Some(format!("tenant_id = {}", tenant.as_u64()))).await?)
  }
}
