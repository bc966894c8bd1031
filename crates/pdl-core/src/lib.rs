//! Core domain model for the prompt dataset loader.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "pdl-core";

/// Rows requested from the remote dataset per run. Only the first page is loaded.
pub const DATASET_PAGE_LENGTH: u32 = 100;

/// Upper bound of the `category` column (`VARCHAR(255)`).
pub const CATEGORY_MAX_LEN: usize = 255;

/// Table populated by the write stage.
pub const AWESOME_CHATGPT_PROMPTS: &str = "awesome_chatgpt_prompts";

/// Table seeded and verified by the read stage.
pub const CHATGPT_PROMPTS: &str = "chatgpt_prompts";

/// One (prompt, category) pair as delivered by the remote dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRow {
    pub prompt: String,
    #[serde(default)]
    pub category: Option<String>,
}

impl DatasetRow {
    pub fn new(prompt: impl Into<String>, category: Option<String>) -> Self {
        Self {
            prompt: prompt.into(),
            category,
        }
    }
}

/// Persisted row. `id` is assigned by the store; both text columns are nullable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRecord {
    pub id: i32,
    pub prompt: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RowsPage {
    rows: Vec<RowEnvelope>,
}

#[derive(Debug, Deserialize)]
struct RowEnvelope {
    row: DatasetRow,
}

/// Decode a `{"rows": [{"row": {...}}, ...]}` page body, preserving row order.
pub fn parse_rows_page(bytes: &[u8]) -> Result<Vec<DatasetRow>, serde_json::Error> {
    let page: RowsPage = serde_json::from_slice(bytes)?;
    Ok(page.rows.into_iter().map(|envelope| envelope.row).collect())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableNameError {
    #[error("table name is empty")]
    Empty,
    #[error("table name `{0}` exceeds 63 bytes")]
    TooLong(String),
    #[error("table name `{0}` is not a plain SQL identifier")]
    InvalidIdentifier(String),
}

/// SQL identifier that is safe to interpolate into statements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Result<Self, TableNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(TableNameError::Empty);
        }
        if name.len() > 63 {
            return Err(TableNameError::TooLong(name));
        }
        let mut chars = name.chars();
        let head_ok = chars
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
        if !head_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(TableNameError::InvalidIdentifier(name));
        }
        Ok(Self(name))
    }

    pub fn awesome_chatgpt_prompts() -> Self {
        Self(AWESOME_CHATGPT_PROMPTS.to_string())
    }

    pub fn chatgpt_prompts() -> Self {
        Self(CHATGPT_PROMPTS.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TableName {
    type Err = TableNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TableName {
    type Error = TableNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TableName> for String {
    fn from(value: TableName) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_decodes_prompt_and_optional_category() {
        let body = br#"{
            "features": [],
            "rows": [
                {"row_idx": 0, "row": {"act": "Linux Terminal", "prompt": "Act as a Linux Terminal"}, "truncated_cells": []},
                {"row_idx": 1, "row": {"prompt": "Act as a Poet", "category": "writing"}},
                {"row_idx": 2, "row": {"prompt": "Act as a Chef", "category": null}}
            ]
        }"#;

        let rows = parse_rows_page(body).expect("page");
        assert_eq!(
            rows,
            vec![
                DatasetRow::new("Act as a Linux Terminal", None),
                DatasetRow::new("Act as a Poet", Some("writing".into())),
                DatasetRow::new("Act as a Chef", None),
            ]
        );
    }

    #[test]
    fn page_without_rows_or_prompt_is_rejected() {
        assert!(parse_rows_page(br#"{"error": "not ready"}"#).is_err());
        assert!(parse_rows_page(br#"{"rows": [{"row": {"category": "x"}}]}"#).is_err());
        assert!(parse_rows_page(b"<html>").is_err());
    }

    #[test]
    fn empty_page_is_valid() {
        assert!(parse_rows_page(br#"{"rows": []}"#).expect("page").is_empty());
    }

    #[test]
    fn table_names_are_validated() {
        assert_eq!(
            TableName::new("chatgpt_prompts").expect("valid").as_str(),
            CHATGPT_PROMPTS
        );
        assert_eq!(TableName::new(""), Err(TableNameError::Empty));
        assert!(matches!(
            TableName::new("prompts; DROP TABLE x"),
            Err(TableNameError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            TableName::new("1prompts"),
            Err(TableNameError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            TableName::new("p".repeat(64)),
            Err(TableNameError::TooLong(_))
        ));
    }

    #[test]
    fn table_name_deserializes_through_validation() {
        let ok: TableName = serde_json::from_str("\"_staging_prompts\"").expect("valid");
        assert_eq!(ok.to_string(), "_staging_prompts");
        assert!(serde_json::from_str::<TableName>("\"bad-name\"").is_err());
    }
}
