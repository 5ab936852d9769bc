//! Charts of a fetched hierarchy: SVG images rendered with plotters and an
//! interactive sunburst page.

mod charts;
mod sunburst;

use charts::{
    block_counts, render_block_treemap, render_depth_chart, render_network,
    render_relationship_graph,
};
use sunburst::{render_sunburst_html, sunburst_data};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::{
    common::timestamped_path,
    export::write_text_file,
    model::{CodeNode, FlatRecord},
    relations::{CodeGraph, RelationReport},
};

#[derive(Debug, Clone)]
pub struct VisualizeOptions {
    pub max_network_nodes: usize,
    pub title: String,
}

impl Default for VisualizeOptions {
    fn default() -> Self {
        Self {
            max_network_nodes: 500,
            title: "ICD-10 Diagnostic Code Hierarchy".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VisualizationSet {
    pub depth_chart: Option<PathBuf>,
    pub treemap: Option<PathBuf>,
    pub network: Option<PathBuf>,
    pub sunburst_data: Option<PathBuf>,
    pub sunburst_page: Option<PathBuf>,
}

impl VisualizationSet {
    pub fn paths(&self) -> Vec<&Path> {
        [
            &self.depth_chart,
            &self.treemap,
            &self.network,
            &self.sunburst_data,
            &self.sunburst_page,
        ]
        .into_iter()
        .flatten()
        .map(PathBuf::as_path)
        .collect()
    }
}

/// Renders every chart for `tree` into `viz_dir` under timestamped names.
/// `records` must be the flattened form of `tree`.
pub fn render_all(
    tree: &CodeNode,
    records: &[FlatRecord],
    viz_dir: &Path,
    options: &VisualizeOptions,
) -> Result<VisualizationSet> {
    let mut set = VisualizationSet::default();

    let path = timestamped_path(viz_dir, "depth_distribution", "svg");
    write_text_file(&path, &render_depth_chart(records, (1200, 800))?)?;
    set.depth_chart = Some(path);

    if block_counts(records).is_empty() {
        info!("no block-shaped codes in hierarchy; skipping treemap");
    } else {
        let path = timestamped_path(viz_dir, "code_treemap", "svg");
        write_text_file(&path, &render_block_treemap(records, (1600, 1000))?)?;
        set.treemap = Some(path);
    }

    let path = timestamped_path(viz_dir, "hierarchy_network", "svg");
    write_text_file(
        &path,
        &render_network(tree, options.max_network_nodes, (1600, 1600))?,
    )?;
    set.network = Some(path);

    let data = sunburst_data(tree);
    let path = timestamped_path(viz_dir, "sunburst_data", "json");
    let json = serde_json::to_string_pretty(&data).context("Failed serializing sunburst data")?;
    write_text_file(&path, &json)?;
    set.sunburst_data = Some(path);

    let path = timestamped_path(viz_dir, "interactive_hierarchy", "html");
    write_text_file(&path, &render_sunburst_html(&data, &options.title)?)?;
    set.sunburst_page = Some(path);

    for path in set.paths() {
        info!(path = %path.display(), "saved visualization");
    }
    Ok(set)
}

/// Writes the relationship graph of `report` as an SVG file.
pub fn write_relationship_graph(
    report: &RelationReport,
    graph: &CodeGraph,
    output_path: &Path,
) -> Result<()> {
    write_text_file(output_path, &render_relationship_graph(report, graph, (1400, 1400))?)?;
    info!(code = %report.code, path = %output_path.display(), "saved relationship graph");
    Ok(())
}
