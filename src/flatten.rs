use crate::model::{CodeNode, FlatRecord};

/// Lazy pre-order walk over a tree, yielding one [`FlatRecord`] per node.
pub struct FlatRecords<'a> {
    stack: Vec<Frame<'a>>,
}

struct Frame<'a> {
    node: &'a CodeNode,
    parent: Option<&'a CodeNode>,
    ancestors: Vec<String>,
}

impl<'a> FlatRecords<'a> {
    pub fn new(root: &'a CodeNode) -> Self {
        Self {
            stack: vec![Frame {
                node: root,
                parent: None,
                ancestors: Vec::new(),
            }],
        }
    }
}

impl Iterator for FlatRecords<'_> {
    type Item = FlatRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let Frame {
            node,
            parent,
            ancestors,
        } = self.stack.pop()?;

        let depth = ancestors.len();
        let mut path = ancestors;
        path.push(node.code.clone());

        for child in node.children.iter().rev() {
            self.stack.push(Frame {
                node: child,
                parent: Some(node),
                ancestors: path.clone(),
            });
        }

        Some(FlatRecord {
            code: node.code.clone(),
            name: node.name.clone(),
            status: node.status,
            depth,
            parent_code: parent.map(|p| p.code.clone()),
            parent_name: parent.map(|p| p.name.clone()).filter(|n| !n.is_empty()),
            path,
            is_leaf: node.children.is_empty(),
            child_count: node.children.len(),
            includes: node.includes.clone(),
            excludes: node.excludes.clone(),
            error: node.error.as_ref().map(|e| e.message.clone()),
        })
    }
}

pub fn extract_all_codes(tree: &CodeNode) -> Vec<FlatRecord> {
    FlatRecords::new(tree).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::FailureKind, model::LookupFailure};

    fn node(code: &str, children: Vec<CodeNode>) -> CodeNode {
        let mut n = CodeNode::new(code);
        n.name = format!("Navn {code}");
        n.children = children;
        n
    }

    fn sample() -> CodeNode {
        node(
            "V",
            vec![
                node(
                    "F30-F39",
                    vec![
                        node("F32", vec![node("F32.0", vec![]), node("F32.1", vec![])]),
                        node("F33", vec![]),
                    ],
                ),
                node("F40-F48", vec![]),
            ],
        )
    }

    #[test]
    fn one_record_per_node_in_pre_order() {
        let tree = sample();
        let records = extract_all_codes(&tree);
        assert_eq!(records.len(), tree.node_count());
        let codes: Vec<_> = records.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(
            codes,
            vec!["V", "F30-F39", "F32", "F32.0", "F32.1", "F33", "F40-F48"]
        );
    }

    #[test]
    fn records_carry_ancestor_chain() {
        let tree = sample();
        let records = extract_all_codes(&tree);
        let f321 = records.iter().find(|r| r.code == "F32.1").unwrap();
        assert_eq!(f321.path, vec!["V", "F30-F39", "F32", "F32.1"]);
        assert_eq!(f321.path_display(), "V > F30-F39 > F32 > F32.1");
        assert_eq!(f321.depth, 3);
        assert_eq!(f321.parent_code.as_deref(), Some("F32"));
        assert_eq!(f321.parent_name.as_deref(), Some("Navn F32"));
        assert!(f321.is_leaf);

        let root = &records[0];
        assert_eq!(root.depth, 0);
        assert_eq!(root.parent_code, None);
        assert_eq!(root.child_count, 2);
    }

    #[test]
    fn restartable_and_carries_failures() {
        let mut tree = sample();
        tree.children[1].error = Some(LookupFailure {
            kind: FailureKind::Client,
            message: "status 400".into(),
            attempts: 1,
        });
        let first = extract_all_codes(&tree);
        let second: Vec<_> = FlatRecords::new(&tree).collect();
        assert_eq!(first, second);
        let failed = first.iter().find(|r| r.code == "F40-F48").unwrap();
        assert_eq!(failed.error.as_deref(), Some("status 400"));
    }

    #[test]
    fn single_node_tree() {
        let records = extract_all_codes(&CodeNode::new("F32"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, vec!["F32"]);
    }
}
