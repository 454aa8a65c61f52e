use serde::{Deserialize, Serialize};

use crate::error::{ExecutorError, Result};

/// Parsed database table reference.
///
/// References arrive as dot-delimited, optionally double-quoted strings with
/// one to three segments. The last two segments are the schema and table; a
/// leading database/catalog segment is discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub full_name: String,
    pub schema: String,
    pub table: String,
}

impl SourceInfo {
    /// Parse a qualified table name into components.
    pub fn parse(table_name: &str) -> Result<Self> {
        let parts: Vec<String> = table_name
            .split('.')
            .map(|p| p.trim().trim_matches('"').to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if parts.len() < 2 {
            return Err(ExecutorError::MalformedReference {
                reference: table_name.to_string(),
            });
        }
        let table = parts[parts.len() - 1].clone();
        let schema = parts[parts.len() - 2].clone();
        Ok(Self {
            full_name: format!("{}.{}", schema, table),
            schema,
            table,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_three_part_reference_drops_database() {
        let source = SourceInfo::parse("\"db\".\"public\".\"orders\"").unwrap();
        assert_eq!(source.schema, "public");
        assert_eq!(source.table, "orders");
        assert_eq!(source.full_name, "public.orders");
    }

    #[test]
    fn test_parse_two_part_reference() {
        let source = SourceInfo::parse("public.orders").unwrap();
        assert_eq!(source.schema, "public");
        assert_eq!(source.table, "orders");
    }

    #[test]
    fn test_parse_mixed_quoting() {
        let source = SourceInfo::parse("warehouse.\"Staging\".events").unwrap();
        assert_eq!(source.schema, "Staging");
        assert_eq!(source.table, "events");
    }

    #[test]
    fn test_parse_single_segment_is_malformed() {
        let err = SourceInfo::parse("orders").unwrap_err();
        assert!(matches!(err, ExecutorError::MalformedReference { .. }));
    }

    #[test]
    fn test_parse_empty_is_malformed() {
        assert!(SourceInfo::parse("").is_err());
        assert!(SourceInfo::parse("\"\".\"\"").is_err());
    }
}
