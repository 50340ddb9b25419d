//! Job table mappings
//!
//! A mapping names the system table a job reconciles, the upload column that
//! carries the record key, and the tracked fields compared per record.
//! Upload cells arrive as text; they are trimmed on projection, and cells of
//! numeric fields become JSON numbers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tillsync_domain::{JobType, ReconciliationJob, Result, TillSyncError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMapping {
    pub table_name: String,
    pub key_column: String,
    pub fields: Vec<String>,
    /// Tracked fields holding numbers.
    #[serde(default)]
    pub numeric_fields: Vec<String>,
}

impl TableMapping {
    pub fn new(
        table_name: impl Into<String>,
        key_column: impl Into<String>,
        fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            key_column: key_column.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            numeric_fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_numeric_fields(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.numeric_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn default_for(job_type: JobType) -> Self {
        match job_type {
            JobType::Inventory => {
                Self::new("products", "sku", ["stock"]).with_numeric_fields(["stock"])
            }
            JobType::Sales => Self::new("sales", "sale_id", ["total", "quantity"])
                .with_numeric_fields(["total", "quantity"]),
            JobType::Customers => Self::new("customers", "customer_id", ["name", "email", "phone"]),
            JobType::Orders => {
                Self::new("orders", "order_id", ["status", "total"]).with_numeric_fields(["total"])
            }
            JobType::Financial => Self::new("ledger_entries", "entry_id", ["amount", "account"])
                .with_numeric_fields(["amount"]),
        }
    }

    /// `job.metadata.mapping` when present, otherwise the job type default.
    pub fn for_job(job: &ReconciliationJob) -> Result<Self> {
        let mapping = match job.metadata.get("mapping") {
            None | Some(Value::Null) => Self::default_for(job.job_type),
            Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
                TillSyncError::InvalidInput(format!("invalid mapping for job {}: {e}", job.id))
            })?,
        };
        mapping.validate()?;
        Ok(mapping)
    }

    fn validate(&self) -> Result<()> {
        if self.table_name.trim().is_empty() || self.key_column.trim().is_empty() {
            return Err(TillSyncError::InvalidInput(
                "mapping needs a table name and a key column".into(),
            ));
        }
        if self.fields.is_empty() {
            return Err(TillSyncError::InvalidInput("mapping tracks no fields".into()));
        }
        Ok(())
    }

    /// Trimmed, non-empty key of an upload row.
    pub fn record_key(&self, row: &Map<String, Value>) -> Option<String> {
        let key = match row.get(&self.key_column)? {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        (!key.is_empty()).then_some(key)
    }

    /// Key column plus the tracked fields present in `row`, with cells
    /// normalised.
    pub fn project(&self, row: &Map<String, Value>) -> Value {
        let mut projected = Map::new();
        for column in std::iter::once(&self.key_column).chain(&self.fields) {
            if let Some(value) = row.get(column) {
                projected.insert(column.clone(), self.normalize_cell(column, value));
            }
        }
        Value::Object(projected)
    }

    /// Fields of an uploaded record to write onto the live record, each
    /// re-typed to match the live field. The key column is only written when
    /// the record does not exist yet.
    pub fn patch_from(&self, uploaded: &Value, live: Option<&Value>) -> Value {
        let key = live.is_none().then_some(&self.key_column);
        let mut patch = Map::new();
        for field in key.into_iter().chain(&self.fields) {
            if let Some(value) = uploaded.get(field) {
                let current = live.and_then(|record| record.get(field));
                patch.insert(field.clone(), conform(value, current));
            }
        }
        Value::Object(patch)
    }

    fn normalize_cell(&self, column: &str, value: &Value) -> Value {
        let Value::String(raw) = value else {
            return value.clone();
        };
        let cell = raw.trim();
        if cell.is_empty() {
            return Value::Null;
        }
        if self.numeric_fields.iter().any(|f| f == column) {
            if let Some(number) = parse_number(cell) {
                return number;
            }
        }
        Value::String(cell.to_string())
    }

    /// Tracked fields the upload actually carries.
    pub fn fields_in(&self, headers: &[String]) -> Vec<String> {
        self.fields.iter().filter(|f| headers.contains(f)).cloned().collect()
    }
}

/// Re-type `value` to the JSON type of `current` when it converts cleanly.
fn conform(value: &Value, current: Option<&Value>) -> Value {
    match (value, current) {
        (Value::String(text), Some(Value::Number(_))) => {
            parse_number(text.trim()).unwrap_or_else(|| value.clone())
        }
        (Value::String(text), Some(Value::Bool(_))) => {
            match text.trim().to_ascii_lowercase().as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => value.clone(),
            }
        }
        (Value::Number(number), Some(Value::String(_))) => Value::String(number.to_string()),
        _ => value.clone(),
    }
}

fn parse_number(text: &str) -> Option<Value> {
    if let Ok(integer) = text.parse::<i64>() {
        return Some(Value::from(integer));
    }
    if let Ok(integer) = text.parse::<u64>() {
        return Some(Value::from(integer));
    }
    text.parse::<f64>().ok().and_then(Number::from_f64).map(Value::Number)
}
