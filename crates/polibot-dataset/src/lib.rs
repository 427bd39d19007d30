//! polibot-dataset: the dataset loader boundary.
//!
//! The scheduler consumes normalized rows through the [`DatasetLoader`]
//! trait and never touches spreadsheet mechanics. This crate owns the
//! normalization of heterogeneous expiry values (text dates and
//! spreadsheet serial numerals) plus two loader implementations: an
//! in-memory registry and a JSON file loader for the CLI.
//!
//! Datasets are keyed by `dataset_ref`. Each rule evaluates the dataset it
//! was configured against; there is no shared "last upload" buffer, so
//! concurrent uploads by different users cannot clobber each other.

pub mod normalize;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use tokio::sync::RwLock;

use polibot_types::DatasetRow;

use crate::normalize::{format_premium, normalize_expiry, ExpiryValue};

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("dataset not found: {0}")]
    NotFound(String),
    #[error("failed to read dataset: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse dataset: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Resolves a `dataset_ref` to the current normalized row list.
///
/// Implementations should return the ordered rows of the dataset as of the
/// call; the scheduler re-fetches on every fire so a replaced dataset takes
/// effect at the next evaluation.
#[async_trait::async_trait]
pub trait DatasetLoader: Send + Sync {
    async fn load_rows(&self, dataset_ref: &str) -> Result<Vec<DatasetRow>, DatasetError>;
}

/// Raw row as present in a dataset file, before expiry normalization.
#[derive(Debug, Clone, Deserialize)]
struct RawRow {
    #[serde(default)]
    expiry: Option<ExpiryValue>,
    #[serde(default)]
    customer: String,
    #[serde(default)]
    plate: String,
    #[serde(default)]
    premium: Option<serde_json::Value>,
    #[serde(default)]
    company: String,
}

fn normalize_row(raw: RawRow) -> DatasetRow {
    let premium = match raw.premium {
        Some(serde_json::Value::Number(n)) => n
            .as_f64()
            .map(format_premium)
            .unwrap_or_else(|| n.to_string()),
        Some(serde_json::Value::String(s)) => s,
        _ => String::new(),
    };
    DatasetRow {
        expiry: raw.expiry.as_ref().and_then(normalize_expiry),
        customer: raw.customer,
        plate: raw.plate,
        premium,
        company: raw.company,
    }
}

// ──────────────────── In-memory loader ────────────────────

/// Dataset registry held in memory, keyed by `dataset_ref`.
///
/// Inserting under an existing ref replaces the whole dataset, matching the
/// "periodically replaced spreadsheet" model.
#[derive(Default)]
pub struct MemoryDatasetLoader {
    datasets: RwLock<HashMap<String, Vec<DatasetRow>>>,
}

impl MemoryDatasetLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the dataset under `dataset_ref`.
    pub async fn insert(&self, dataset_ref: &str, rows: Vec<DatasetRow>) {
        tracing::debug!(dataset_ref, rows = rows.len(), "Dataset installed");
        self.datasets
            .write()
            .await
            .insert(dataset_ref.to_string(), rows);
    }

    /// Remove the dataset under `dataset_ref`. Returns false if absent.
    pub async fn remove(&self, dataset_ref: &str) -> bool {
        self.datasets.write().await.remove(dataset_ref).is_some()
    }
}

#[async_trait::async_trait]
impl DatasetLoader for MemoryDatasetLoader {
    async fn load_rows(&self, dataset_ref: &str) -> Result<Vec<DatasetRow>, DatasetError> {
        self.datasets
            .read()
            .await
            .get(dataset_ref)
            .cloned()
            .ok_or_else(|| DatasetError::NotFound(dataset_ref.to_string()))
    }
}

// ──────────────────── JSON file loader ────────────────────

/// Loads datasets from JSON files under a root directory.
///
/// A `dataset_ref` of `policies-2025` resolves to
/// `<root>/policies-2025.json`, an array of raw rows. Expiry values may be
/// text dates or spreadsheet serial numbers; both are normalized on load.
pub struct JsonFileDatasetLoader {
    root: PathBuf,
}

impl JsonFileDatasetLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, dataset_ref: &str) -> PathBuf {
        self.root.join(format!("{dataset_ref}.json"))
    }
}

#[async_trait::async_trait]
impl DatasetLoader for JsonFileDatasetLoader {
    async fn load_rows(&self, dataset_ref: &str) -> Result<Vec<DatasetRow>, DatasetError> {
        let path = self.path_for(dataset_ref);
        if !path.exists() {
            return Err(DatasetError::NotFound(dataset_ref.to_string()));
        }
        let content = tokio::fs::read_to_string(&path).await?;
        let raw: Vec<RawRow> = serde_json::from_str(&content)?;
        Ok(raw.into_iter().map(normalize_row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_loader_roundtrip() {
        let loader = MemoryDatasetLoader::new();
        let rows = vec![DatasetRow {
            expiry: Some("1.3.2025".into()),
            customer: "Alice".into(),
            plate: "34 A 1".into(),
            premium: "100.00".into(),
            company: "Acme".into(),
        }];
        loader.insert("ds-1", rows.clone()).await;
        assert_eq!(loader.load_rows("ds-1").await.unwrap(), rows);
    }

    #[tokio::test]
    async fn test_memory_loader_not_found() {
        let loader = MemoryDatasetLoader::new();
        assert!(matches!(
            loader.load_rows("missing").await,
            Err(DatasetError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_loader_replace_is_per_ref() {
        let loader = MemoryDatasetLoader::new();
        loader.insert("user-a", vec![]).await;
        loader
            .insert(
                "user-b",
                vec![DatasetRow {
                    expiry: None,
                    customer: "Bob".into(),
                    plate: String::new(),
                    premium: String::new(),
                    company: String::new(),
                }],
            )
            .await;
        // Replacing one user's dataset leaves the other untouched.
        loader.insert("user-a", vec![]).await;
        assert_eq!(loader.load_rows("user-b").await.unwrap().len(), 1);
    }

    #[test]
    fn test_raw_row_normalization() {
        let json = r#"{
            "expiry": 45720,
            "customer": "Alice",
            "plate": "34 A 1",
            "premium": 1234.5,
            "company": "Acme"
        }"#;
        let raw: RawRow = serde_json::from_str(json).unwrap();
        let row = normalize_row(raw);
        assert_eq!(row.expiry.as_deref(), Some("4.3.2025"));
        assert_eq!(row.premium, "1234.50");
    }

    #[test]
    fn test_raw_row_text_fields_pass_through() {
        let json = r#"{"expiry": "7.8.2026", "premium": "750,00 TL"}"#;
        let raw: RawRow = serde_json::from_str(json).unwrap();
        let row = normalize_row(raw);
        assert_eq!(row.expiry.as_deref(), Some("7.8.2026"));
        assert_eq!(row.premium, "750,00 TL");
    }

    #[tokio::test]
    async fn test_json_file_loader() {
        let dir = std::env::temp_dir().join(format!("polibot-ds-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join("policies.json"),
            r#"[{"expiry":"1.3.2025","customer":"Alice"},{"expiry":45720}]"#,
        )
        .await
        .unwrap();

        let loader = JsonFileDatasetLoader::new(&dir);
        let rows = loader.load_rows("policies").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].customer, "Alice");
        assert_eq!(rows[1].expiry.as_deref(), Some("4.3.2025"));

        assert!(matches!(
            loader.load_rows("absent").await,
            Err(DatasetError::NotFound(_))
        ));
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
