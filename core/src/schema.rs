use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// The three type categories a column can be declared as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Number,
    Date,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ColumnType::Text => "text",
            ColumnType::Number => "number",
            ColumnType::Date => "date",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Opaque handle to where a dataset's bytes live. Only storage adapters
/// interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageRef(pub String);

impl fmt::Display for StorageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered, declared schema of a dataset as reported by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSchema {
    pub dataset_id: String,
    columns: Vec<Column>,
    pub row_count: Option<u64>,
    pub storage: StorageRef,
}

impl DatasetSchema {
    /// Build a schema, rejecting duplicate column names.
    pub fn try_new(
        dataset_id: impl Into<String>,
        columns: Vec<Column>,
        row_count: Option<u64>,
        storage: StorageRef,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                anyhow::bail!("duplicate column name '{}'", column.name);
            }
        }
        Ok(Self {
            dataset_id: dataset_id.into(),
            columns,
            row_count,
            storage,
        })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Position and declaration of a column, by name.
    pub fn column(&self, name: &str) -> Option<(usize, &Column)> {
        self.columns.iter().enumerate().find(|(_, c)| c.name == name)
    }

    /// Arrow schema used to decode raw chunks. Every column is read as
    /// nullable text; typed interpretation happens in the predicate.
    pub fn raw_arrow_schema(&self) -> arrow::datatypes::SchemaRef {
        let fields: Vec<arrow::datatypes::Field> = self
            .columns
            .iter()
            .map(|c| arrow::datatypes::Field::new(&c.name, arrow::datatypes::DataType::Utf8, true))
            .collect();
        Arc::new(arrow::datatypes::Schema::new(fields))
    }
}

/// Read-only view of the external dataset registry.
#[async_trait]
pub trait DatasetRegistry: Send + Sync {
    async fn schema(&self, dataset_id: &str) -> Result<Option<DatasetSchema>>;
}

#[derive(Default, Clone)]
pub struct InMemoryDatasetRegistry {
    datasets: Arc<RwLock<HashMap<String, DatasetSchema>>>,
}

impl InMemoryDatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, schema: DatasetSchema) {
        let mut datasets = self.datasets.write().await;
        datasets.insert(schema.dataset_id.clone(), schema);
    }
}

#[async_trait]
impl DatasetRegistry for InMemoryDatasetRegistry {
    async fn schema(&self, dataset_id: &str) -> Result<Option<DatasetSchema>> {
        let datasets = self.datasets.read().await;
        Ok(datasets.get(dataset_id).cloned())
    }
}
