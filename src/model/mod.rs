//! Variable table and matrix payload types produced by inspection.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One row of the variable table, as printed by a probe's query command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableRecord {
    #[serde(rename = "varName")]
    pub name: String,
    #[serde(rename = "varType")]
    pub var_type: String,
    #[serde(rename = "varSize", deserialize_with = "deserialize_size")]
    pub size: String,
    #[serde(rename = "varShape")]
    pub shape: String,
    #[serde(rename = "varContent")]
    pub content_preview: String,
    #[serde(rename = "isMatrix")]
    pub is_matrix: bool,
}

/// Sizes are strings on the wire, but some listings print bare byte counts.
fn deserialize_size<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    struct SizeVisitor;

    impl<'de> de::Visitor<'de> for SizeVisitor {
        type Value = String;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a size string or number")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(v.to_string())
        }

        fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v.to_string())
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Ok(v.to_string())
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
            Ok(v.to_string())
        }
    }

    deserializer.deserialize_any(SizeVisitor)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectionTitle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_name: Option<String>,
}

/// A decoded variable-table snapshot. Order is whatever the kernel listed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectionUpdate {
    pub title: InspectionTitle,
    #[serde(rename = "payload")]
    pub variables: Vec<VariableRecord>,
}

impl InspectionUpdate {
    /// Title-only update shown while a kernel restarts.
    pub fn restarting(notice: impl Into<String>) -> Self {
        Self {
            title: InspectionTitle {
                context_name: Some(notice.into()),
                ..Default::default()
            },
            variables: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableField {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub fields: Vec<TableField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<Vec<String>>,
}

/// Tabular payload of a matrix-like variable (a JSON "table" description:
/// typed columns in `schema`, one object per row in `data`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixModel {
    pub schema: TableSchema,
    #[serde(default)]
    pub data: Vec<Map<String, Value>>,
}

impl MatrixModel {
    pub fn row_count(&self) -> usize {
        self.data.len()
    }

    pub fn column_count(&self) -> usize {
        self.schema.fields.len()
    }

    pub fn column_name(&self, column: usize) -> Option<&str> {
        self.schema.fields.get(column).map(|f| f.name.as_str())
    }

    pub fn cell(&self, row: usize, column: usize) -> Option<&Value> {
        let name = self.column_name(column)?;
        self.data.get(row)?.get(name)
    }

    pub(crate) fn truncate_rows(&mut self, max_rows: usize) {
        self.data.truncate(max_rows);
    }
}
