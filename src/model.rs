use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{FailureKind, LookupError};

/// A code record as returned by the hierarchy endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCode {
    pub code_value: String,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub name_norwegian: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_bool",
        skip_serializing_if = "Option::is_none"
    )]
    pub active: Option<bool>,
    #[serde(
        default,
        deserialize_with = "lenient_bool",
        skip_serializing_if = "Option::is_none"
    )]
    pub is_leaf_node: Option<bool>,
    #[serde(
        default,
        deserialize_with = "lenient_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub sort_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub includes: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excludes: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<ApiCode>>,
}

// The API is not consistent about scalar types: flags and sort indexes show up
// as strings in some payloads. Values that cannot be read become `None`.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(text)) => Some(text),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Bool(flag)) => Some(flag),
        Some(Value::Number(n)) => n.as_i64().map(|v| v != 0),
        Some(Value::String(text)) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|v| v as i64)),
        Some(Value::String(text)) => text.trim().parse().ok(),
        _ => None,
    })
}

impl ApiCode {
    /// Decodes one record, keeping the code even when other fields are
    /// unreadable. `None` when there is no usable code value.
    pub fn from_record(record: Value) -> Option<Self> {
        let code_value = match record.get("codeValue") {
            Some(Value::String(code)) if !code.trim().is_empty() => code.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return None,
        };
        match serde_json::from_value::<ApiCode>(record.clone()) {
            Ok(mut decoded) => {
                decoded.code_value = code_value;
                Some(decoded)
            }
            Err(err) => {
                tracing::warn!(
                    code = %code_value,
                    error = %err,
                    "kept code from partly unreadable record"
                );
                Some(ApiCode {
                    code_value,
                    name_norwegian: record
                        .get("nameNorwegian")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    name: record.get("name").and_then(Value::as_str).map(str::to_string),
                    ..ApiCode::default()
                })
            }
        }
    }

    pub fn display_name(&self) -> String {
        self.name_norwegian
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or_default()
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeStatus {
    Active,
    Inactive,
    #[default]
    Unknown,
}

impl CodeStatus {
    pub fn from_flag(active: Option<bool>) -> Self {
        match active {
            Some(true) => CodeStatus::Active,
            Some(false) => CodeStatus::Inactive,
            None => CodeStatus::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CodeStatus::Active => "active",
            CodeStatus::Inactive => "inactive",
            CodeStatus::Unknown => "unknown",
        }
    }
}

/// Marker left on a node whose lookup did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupFailure {
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

impl LookupFailure {
    pub fn from_error(err: &LookupError, attempts: u32) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeNode {
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: CodeStatus,
    /// The API flagged this code as having no children.
    #[serde(default)]
    pub reported_leaf: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub includes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excludes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<LookupFailure>,
    #[serde(default)]
    pub children: Vec<CodeNode>,
}

impl CodeNode {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: String::new(),
            status: CodeStatus::Unknown,
            reported_leaf: false,
            sort_index: None,
            includes: None,
            excludes: None,
            error: None,
            children: Vec::new(),
        }
    }

    /// Builds a node from an API record without its nested children.
    pub fn from_api(record: &ApiCode) -> Self {
        Self {
            code: record.code_value.trim().to_string(),
            name: record.display_name(),
            status: CodeStatus::from_flag(record.active),
            reported_leaf: record.is_leaf_node.unwrap_or(false),
            sort_index: record.sort_index,
            includes: record.includes.as_ref().and_then(note_text),
            excludes: record.excludes.as_ref().and_then(note_text),
            error: None,
            children: Vec::new(),
        }
    }

    /// Builds a node and all nested children embedded in the record.
    pub fn from_api_tree(record: &ApiCode) -> Self {
        let mut node = Self::from_api(record);
        node.children = record
            .children
            .iter()
            .flatten()
            .filter(|child| !child.code_value.trim().is_empty())
            .map(Self::from_api_tree)
            .collect();
        node
    }

    /// Builds a tree from a `/hierarchy` response. A bare list of nodes, or an
    /// object without a code, is hung under a synthetic `root_code` node.
    pub fn from_hierarchy_document(
        payload: Value,
        root_code: &str,
    ) -> Result<Self, serde_json::Error> {
        let has_code = payload
            .get("codeValue")
            .and_then(Value::as_str)
            .is_some_and(|code| !code.trim().is_empty());
        if has_code {
            let record: ApiCode = serde_json::from_value(payload)?;
            return Ok(Self::from_api_tree(&record));
        }

        let items = match payload {
            Value::Array(items) => items,
            Value::Object(mut obj) => match obj.remove("children").or_else(|| obj.remove("data")) {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        let records: Vec<ApiCode> = serde_json::from_value(Value::Array(items))?;
        let mut root = Self::new(root_code);
        root.children = records
            .iter()
            .filter(|record| !record.code_value.trim().is_empty())
            .map(Self::from_api_tree)
            .collect();
        Ok(root)
    }

    /// Copies descriptive fields from a details lookup, keeping code and children.
    pub fn apply_details(&mut self, record: &ApiCode) {
        let name = record.display_name();
        if !name.is_empty() {
            self.name = name;
        }
        if record.active.is_some() {
            self.status = CodeStatus::from_flag(record.active);
        }
        if let Some(leaf) = record.is_leaf_node {
            self.reported_leaf = leaf;
        }
        self.sort_index = record.sort_index.or(self.sort_index);
        if let Some(includes) = record.includes.as_ref().and_then(note_text) {
            self.includes = Some(includes);
        }
        if let Some(excludes) = record.excludes.as_ref().and_then(note_text) {
            self.excludes = Some(excludes);
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(CodeNode::node_count).sum::<usize>()
    }

    /// Number of edges on the longest root-to-leaf path.
    pub fn height(&self) -> usize {
        self.children
            .iter()
            .map(|child| child.height() + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn find(&self, code: &str) -> Option<&CodeNode> {
        if self.code == code {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(code))
    }

    #[cfg(test)]
    pub fn codes(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(self.node_count());
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            out.push(node.code.as_str());
            stack.extend(node.children.iter().rev());
        }
        out
    }

    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats::default();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            stats.total += 1;
            if node.children.is_empty() {
                stats.leaves += 1;
            } else {
                stats.parents += 1;
            }
            if node.is_failed() {
                stats.failed += 1;
            }
            if node.status == CodeStatus::Inactive {
                stats.inactive += 1;
            }
            stack.extend(node.children.iter());
        }
        stats.height = self.height();
        stats
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub total: usize,
    pub leaves: usize,
    pub parents: usize,
    pub failed: usize,
    pub inactive: usize,
    pub height: usize,
}

/// One node of the tree with its ancestor chain, for tabular export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatRecord {
    pub code: String,
    pub name: String,
    pub status: CodeStatus,
    pub depth: usize,
    pub parent_code: Option<String>,
    pub parent_name: Option<String>,
    /// Codes from the root down to and including this node.
    pub path: Vec<String>,
    pub is_leaf: bool,
    pub child_count: usize,
    pub includes: Option<String>,
    pub excludes: Option<String>,
    pub error: Option<String>,
}

impl FlatRecord {
    pub const COLUMNS: [&'static str; 12] = [
        "code",
        "name",
        "status",
        "depth",
        "parent_code",
        "parent_name",
        "path",
        "is_leaf",
        "child_count",
        "includes",
        "excludes",
        "error",
    ];

    pub fn path_display(&self) -> String {
        self.path.join(" > ")
    }

    /// Column values in `COLUMNS` order; `None` marks an absent value.
    pub fn row(&self) -> Vec<Option<String>> {
        vec![
            Some(self.code.clone()),
            Some(self.name.clone()),
            Some(self.status.as_str().to_string()),
            Some(self.depth.to_string()),
            self.parent_code.clone(),
            self.parent_name.clone(),
            Some(self.path_display()),
            Some(self.is_leaf.to_string()),
            Some(self.child_count.to_string()),
            self.includes.clone(),
            self.excludes.clone(),
            self.error.clone(),
        ]
    }
}

/// A search result reduced to field name -> raw value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub fields: BTreeMap<String, String>,
}

impl SearchHit {
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let mut fields = BTreeMap::new();
        for (key, field) in obj {
            if key.starts_with('_') {
                continue;
            }
            let raw = match field {
                Value::Object(inner) => inner.get("raw").map(value_to_string),
                other => Some(value_to_string(other)),
            };
            if let Some(raw) = raw {
                fields.insert(key.clone(), raw);
            }
        }
        Some(Self { fields })
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    pub current: u32,
    pub total_pages: u32,
    pub total_results: u64,
}

impl SearchPage {
    pub fn from_value(payload: &Value) -> Self {
        let page = &payload["meta"]["page"];
        let hits = payload["results"]
            .as_array()
            .map(|items| items.iter().filter_map(SearchHit::from_value).collect())
            .unwrap_or_default();
        Self {
            hits,
            current: page["current"].as_u64().unwrap_or(1) as u32,
            total_pages: page["total_pages"].as_u64().unwrap_or(1) as u32,
            total_results: page["total_results"].as_u64().unwrap_or(0),
        }
    }
}

pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(value_to_string)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("; "),
        _ => value.to_string(),
    }
}

fn note_text(value: &Value) -> Option<String> {
    let text = value_to_string(value).trim().to_string();
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn api_code_reads_camel_case_fields() {
        let record: ApiCode = serde_json::from_value(json!({
            "codeValue": "F32",
            "nameNorwegian": "Depressiv episode",
            "active": true,
            "isLeafNode": false,
            "sortIndex": 12,
            "includes": ["enkeltepisode av depressiv reaksjon", "psykogen depresjon"],
            "excludes": null,
            "unknownField": 1
        }))
        .unwrap();
        let node = CodeNode::from_api(&record);
        assert_eq!(node.code, "F32");
        assert_eq!(node.name, "Depressiv episode");
        assert_eq!(node.status, CodeStatus::Active);
        assert!(!node.reported_leaf);
        assert_eq!(
            node.includes.as_deref(),
            Some("enkeltepisode av depressiv reaksjon; psykogen depresjon")
        );
        assert_eq!(node.excludes, None);
    }

    #[test]
    fn from_api_tree_keeps_nested_children() {
        let record: ApiCode = serde_json::from_value(json!({
            "codeValue": "V",
            "children": [
                {"codeValue": "F30-F39", "children": [{"codeValue": "F32"}]},
                {"codeValue": ""},
                {"codeValue": "F40-F48"}
            ]
        }))
        .unwrap();
        let tree = CodeNode::from_api_tree(&record);
        assert_eq!(tree.node_count(), 4);
        assert_eq!(tree.height(), 2);
        assert!(tree.find("F32").is_some());
        assert_eq!(tree.codes(), vec!["V", "F30-F39", "F32", "F40-F48"]);
    }

    #[test]
    fn hierarchy_document_shapes() {
        let rooted = CodeNode::from_hierarchy_document(
            json!({"codeValue": "F", "children": [{"codeValue": "F32"}]}),
            "icd10",
        )
        .unwrap();
        assert_eq!(rooted.code, "F");
        assert_eq!(rooted.node_count(), 2);

        let listed = CodeNode::from_hierarchy_document(
            json!([{"codeValue": "I"}, {"codeValue": "II", "children": [{"codeValue": "C00"}]}]),
            "icd10",
        )
        .unwrap();
        assert_eq!(listed.code, "icd10");
        assert_eq!(listed.codes(), vec!["icd10", "I", "II", "C00"]);

        let wrapped =
            CodeNode::from_hierarchy_document(json!({"data": [{"codeValue": "A"}]}), "icpc2")
                .unwrap();
        assert_eq!(wrapped.codes(), vec!["icpc2", "A"]);

        assert!(CodeNode::from_hierarchy_document(json!([{"codeValue": 5}]), "x").is_err());
    }

    #[test]
    fn stats_count_leaves_and_failures() {
        let mut root = CodeNode::new("F32");
        let mut failed = CodeNode::new("F32.1");
        failed.error = Some(LookupFailure {
            kind: FailureKind::Client,
            message: "status 404".into(),
            attempts: 1,
        });
        root.children = vec![CodeNode::new("F32.0"), failed];
        let stats = root.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.leaves, 2);
        assert_eq!(stats.parents, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.height, 1);
    }

    #[test]
    fn search_hit_reads_raw_values_and_skips_meta() {
        let page = SearchPage::from_value(&json!({
            "meta": {"page": {"current": 2, "total_pages": 3, "total_results": 41}},
            "results": [
                {
                    "code": {"raw": "F32.0"},
                    "term": {"raw": "Lett depressiv episode"},
                    "oid_system": {"raw": "icd10"},
                    "_meta": {"score": 12.5}
                }
            ]
        }));
        assert_eq!(page.current, 2);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.total_results, 41);
        assert_eq!(page.hits.len(), 1);
        let hit = &page.hits[0];
        assert_eq!(hit.get("code"), Some("F32.0"));
        assert_eq!(hit.get("oid_system"), Some("icd10"));
        assert!(hit.get("_meta").is_none());
    }

    #[test]
    fn code_node_json_round_trips_failure_marker() {
        let mut node = CodeNode::new("F99");
        node.error = Some(LookupFailure {
            kind: FailureKind::Transient,
            message: "request timed out".into(),
            attempts: 5,
        });
        let text = serde_json::to_string(&node).unwrap();
        let back: CodeNode = serde_json::from_str(&text).unwrap();
        assert_eq!(back, node);
    }
}
