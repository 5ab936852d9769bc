use anyhow::{Context, Result};
use serde::Serialize;

use crate::model::CodeNode;

const TEMPLATE: &str = include_str!("sunburst.html");

/// Node of the nested data the sunburst page consumes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SunburstNode {
    pub id: String,
    pub name: String,
    pub value: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
    pub children: Vec<SunburstNode>,
}

fn convert(node: &CodeNode, parent: Option<&str>) -> SunburstNode {
    SunburstNode {
        id: node.code.clone(),
        name: if node.name.is_empty() {
            node.code.clone()
        } else {
            node.name.clone()
        },
        value: 1,
        parent: parent.map(str::to_string),
        status: node.is_failed().then_some("failed"),
        children: node
            .children
            .iter()
            .map(|child| convert(child, Some(&node.code)))
            .collect(),
    }
}

pub fn sunburst_data(tree: &CodeNode) -> SunburstNode {
    convert(tree, None)
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Standalone page rendering `data` with D3 v7.
pub fn render_sunburst_html(data: &SunburstNode, title: &str) -> Result<String> {
    let json = serde_json::to_string(data).context("Failed serializing sunburst data")?;
    // Keep a `</script>` inside a name from closing the data block.
    let json = json.replace("</", "<\\/");
    Ok(TEMPLATE
        .replace("__TITLE__", &escape_html(title))
        .replace("__DATA__", &json))
}
