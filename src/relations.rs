//! Relationship graph between codes.
//!
//! Edges come from two places: the parent/child structure of a fetched tree,
//! and code references (`F20.0`, `Z73`, ...) written into a code's name or its
//! inclusion and exclusion notes.

use regex::Regex;
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::LazyLock,
};

use crate::model::{CodeStatus, FlatRecord};

static CODE_REFERENCE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b([A-Z]\d{2}(?:\.\d+)?)\b").ok());

/// ICD-10 style codes mentioned in free text, deduplicated in order of appearance.
pub fn extract_code_references(text: &str) -> Vec<String> {
    let Some(pattern) = CODE_REFERENCE.as_ref() else {
        return Vec::new();
    };
    let mut seen = BTreeSet::new();
    pattern
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|code| seen.insert(code.clone()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    #[serde(rename = "self")]
    SelfCode,
    Parent,
    Child,
    Sibling,
    SameCategory,
    SameChapter,
    Other,
}

impl RelationshipType {
    pub fn as_str(self) -> &'static str {
        match self {
            RelationshipType::SelfCode => "self",
            RelationshipType::Parent => "parent",
            RelationshipType::Child => "child",
            RelationshipType::Sibling => "sibling",
            RelationshipType::SameCategory => "same_category",
            RelationshipType::SameChapter => "same_chapter",
            RelationshipType::Other => "other",
        }
    }
}

/// Three-character category of a code: `F32.1` -> `F32`.
fn category(code: &str) -> &str {
    code.split('.').next().unwrap_or(code)
}

fn chapter(code: &str) -> Option<char> {
    code.chars().next()
}

#[derive(Debug, Default)]
pub struct CodeGraph {
    names: HashMap<String, String>,
    parents: HashMap<String, String>,
    neighbors: BTreeMap<String, BTreeSet<String>>,
    reference_edges: usize,
}

impl CodeGraph {
    pub fn from_records(records: &[FlatRecord]) -> Self {
        let mut graph = CodeGraph::default();

        for record in records {
            if !record.name.is_empty() {
                graph.names.insert(record.code.clone(), record.name.clone());
            }
            graph.neighbors.entry(record.code.clone()).or_default();

            if let Some(parent) = &record.parent_code {
                graph.parents.insert(record.code.clone(), parent.clone());
                graph.link(parent, &record.code);
                graph.link(&record.code, parent);
            }

            let text = [
                Some(record.name.as_str()),
                record.includes.as_deref(),
                record.excludes.as_deref(),
            ]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");

            for referenced in extract_code_references(&text) {
                if referenced != record.code && graph.link(&record.code, &referenced) {
                    graph.reference_edges += 1;
                }
            }
        }
        graph
    }

    fn link(&mut self, from: &str, to: &str) -> bool {
        self.neighbors
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string())
    }

    pub fn contains(&self, code: &str) -> bool {
        self.neighbors.contains_key(code)
    }

    pub fn name(&self, code: &str) -> Option<&str> {
        self.names.get(code).map(String::as_str)
    }

    pub fn code_count(&self) -> usize {
        self.neighbors.len()
    }

    pub fn reference_edges(&self) -> usize {
        self.reference_edges
    }

    /// Codes reachable from `code` in 1..=`max_distance` hops, keyed by their
    /// shortest distance. Each list is sorted.
    pub fn related_within(&self, code: &str, max_distance: usize) -> BTreeMap<usize, Vec<String>> {
        let mut by_distance: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        if !self.contains(code) || max_distance == 0 {
            return by_distance;
        }

        let mut seen: BTreeSet<&str> = BTreeSet::from([code]);
        let mut queue: VecDeque<(&str, usize)> = VecDeque::from([(code, 0)]);
        while let Some((current, distance)) = queue.pop_front() {
            if distance == max_distance {
                continue;
            }
            let Some(next) = self.neighbors.get(current) else {
                continue;
            };
            for neighbor in next {
                if seen.insert(neighbor.as_str()) {
                    by_distance
                        .entry(distance + 1)
                        .or_default()
                        .push(neighbor.clone());
                    queue.push_back((neighbor.as_str(), distance + 1));
                }
            }
        }
        for codes in by_distance.values_mut() {
            codes.sort();
        }
        by_distance
    }

    /// Undirected links among `codes`, as index pairs `(low, high)` into the slice.
    pub fn links_among(&self, codes: &[&str]) -> Vec<(usize, usize)> {
        let index: HashMap<&str, usize> = codes
            .iter()
            .enumerate()
            .map(|(idx, code)| (*code, idx))
            .collect();
        let mut links = BTreeSet::new();
        for (from, code) in codes.iter().enumerate() {
            let Some(next) = self.neighbors.get(*code) else {
                continue;
            };
            for neighbor in next {
                match index.get(neighbor.as_str()) {
                    Some(&to) if to != from => {
                        links.insert((from.min(to), from.max(to)));
                    }
                    _ => {}
                }
            }
        }
        links.into_iter().collect()
    }

    pub fn relationship(&self, source: &str, target: &str) -> RelationshipType {
        if source == target {
            return RelationshipType::SelfCode;
        }
        let source_parent = self.parents.get(source);
        let target_parent = self.parents.get(target);
        if source_parent.is_some_and(|p| p == target) {
            return RelationshipType::Parent;
        }
        if target_parent.is_some_and(|p| p == source) {
            return RelationshipType::Child;
        }
        if source_parent.is_some() && source_parent == target_parent {
            return RelationshipType::Sibling;
        }
        if category(source) == category(target) {
            return RelationshipType::SameCategory;
        }
        if chapter(source).is_some() && chapter(source) == chapter(target) {
            return RelationshipType::SameChapter;
        }
        RelationshipType::Other
    }
}

/// Codes of one chapter grouped by their two-character prefix (`F3` holds
/// `F30-F39`, `F32`, `F32.1`, ...), each group in tree order. The bare chapter
/// code is left out.
pub fn group_by_prefix(records: &[FlatRecord], chapter: &str) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for record in records {
        let code = record.code.as_str();
        if code == chapter || !code.starts_with(chapter) || code.chars().count() < 2 {
            continue;
        }
        let prefix: String = code.chars().take(2).collect();
        groups.entry(prefix).or_default().push(record.code.clone());
    }
    groups
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelatedCode {
    pub code: String,
    pub name: Option<String>,
    pub distance: usize,
    pub relationship: RelationshipType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodeDetails {
    pub name: String,
    pub status: CodeStatus,
    pub parent: Option<String>,
    pub includes: Option<String>,
    pub excludes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelationReport {
    pub code: String,
    pub generated_at_unix: i64,
    pub max_distance: usize,
    pub details: CodeDetails,
    /// The code itself at distance 0, then related codes ordered by distance and code.
    pub related: Vec<RelatedCode>,
}

impl RelationReport {
    pub fn build(
        graph: &CodeGraph,
        code: &str,
        details: CodeDetails,
        max_distance: usize,
        generated_at_unix: i64,
    ) -> Self {
        let mut related = vec![RelatedCode {
            code: code.to_string(),
            name: Some(details.name.clone()).filter(|n| !n.is_empty()),
            distance: 0,
            relationship: RelationshipType::SelfCode,
        }];
        for (distance, codes) in graph.related_within(code, max_distance) {
            related.extend(codes.into_iter().map(|other| RelatedCode {
                name: graph.name(&other).map(str::to_string),
                relationship: graph.relationship(code, &other),
                code: other,
                distance,
            }));
        }

        Self {
            code: code.to_string(),
            generated_at_unix,
            max_distance,
            details,
            related,
        }
    }

    pub fn count_at(&self, distance: usize) -> usize {
        self.related.iter().filter(|r| r.distance == distance).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{flatten::extract_all_codes, model::CodeNode};

    fn node(code: &str, name: &str, children: Vec<CodeNode>) -> CodeNode {
        let mut n = CodeNode::new(code);
        n.name = name.into();
        n.children = children;
        n
    }

    fn sample_graph() -> CodeGraph {
        let mut f320 = node("F32.0", "Lett depressiv episode", vec![]);
        f320.excludes = Some("tilbakevendende depressiv lidelse (F33.-), Z73.0".into());
        let tree = node(
            "F30-F39",
            "Affektive lidelser",
            vec![
                node("F32", "Depressiv episode", vec![f320, node("F32.1", "Moderat", vec![])]),
                node("F33", "Tilbakevendende depressiv lidelse", vec![]),
            ],
        );
        CodeGraph::from_records(&extract_all_codes(&tree))
    }

    #[test]
    fn finds_codes_in_free_text() {
        let text = "Ekskl.: schizofreni (F20.0), F31 og F20.0; ikke f32 eller AF32X";
        assert_eq!(extract_code_references(text), vec!["F20.0", "F31"]);
        assert!(extract_code_references("").is_empty());
    }

    #[test]
    fn related_codes_grouped_by_shortest_distance() {
        let graph = sample_graph();
        let related = graph.related_within("F32.0", 2);
        assert_eq!(related[&1], vec!["F32", "F33", "Z73.0"]);
        assert_eq!(related[&2], vec!["F30-F39", "F32.1"]);
        assert_eq!(graph.reference_edges(), 2);
        assert!(graph.related_within("F32.0", 0).is_empty());
        assert!(graph.related_within("X99", 3).is_empty());
    }

    #[test]
    fn links_among_selected_codes_are_undirected() {
        let graph = sample_graph();
        let links = graph.links_among(&["F32.0", "F32", "Z73.0", "F33.9"]);
        assert_eq!(links, vec![(0, 1), (0, 2)]);
        assert!(graph.links_among(&["F32.0"]).is_empty());
    }

    #[test]
    fn groups_chapter_codes_by_two_character_prefix() {
        let tree = node(
            "F",
            "Psykiske lidelser",
            vec![
                node("F00-F09", "Organiske", vec![node("F00", "Demens", vec![])]),
                node("F30-F39", "Affektive", vec![node("F32", "Depressiv", vec![])]),
            ],
        );
        let mut records = extract_all_codes(&tree);
        records.extend(extract_all_codes(&node("Z73", "Problemer", vec![])));

        let groups = group_by_prefix(&records, "F");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["F0"], vec!["F00-F09", "F00"]);
        assert_eq!(groups["F3"], vec!["F30-F39", "F32"]);
        assert!(group_by_prefix(&records, "Q").is_empty());
    }

    #[test]
    fn relationship_types() {
        let graph = sample_graph();
        assert_eq!(graph.relationship("F32", "F32"), RelationshipType::SelfCode);
        assert_eq!(graph.relationship("F32.0", "F32"), RelationshipType::Parent);
        assert_eq!(graph.relationship("F32", "F32.0"), RelationshipType::Child);
        assert_eq!(graph.relationship("F32.0", "F32.1"), RelationshipType::Sibling);
        assert_eq!(graph.relationship("F32.0", "F33"), RelationshipType::SameChapter);
        assert_eq!(graph.relationship("F33", "F33.1"), RelationshipType::SameCategory);
        assert_eq!(graph.relationship("F32.0", "Z73.0"), RelationshipType::Other);
    }

    #[test]
    fn report_starts_with_self_and_orders_by_distance() {
        let graph = sample_graph();
        let details = CodeDetails {
            name: "Lett depressiv episode".into(),
            status: CodeStatus::Active,
            parent: Some("F32".into()),
            includes: None,
            excludes: None,
        };
        let report = RelationReport::build(&graph, "F32.0", details, 2, 1_700_000_000);
        assert_eq!(report.related[0].relationship, RelationshipType::SelfCode);
        assert_eq!(report.count_at(1), 3);
        assert_eq!(report.count_at(2), 2);
        let distances: Vec<usize> = report.related.iter().map(|r| r.distance).collect();
        assert!(distances.windows(2).all(|w| w[0] <= w[1]));
        let z73 = report.related.iter().find(|r| r.code == "Z73.0").unwrap();
        assert_eq!(z73.name, None);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["related"][0]["relationship"], "self");
    }
}
