use anyhow::{Result, anyhow};
use plotters::prelude::*;
use std::{
    collections::{BTreeMap, VecDeque},
    f64::consts::TAU,
};

use crate::{
    model::{CodeNode, FlatRecord},
    relations::{CodeGraph, RelationReport},
};

const PALETTE: [RGBColor; 8] = [
    RGBColor(68, 1, 84),
    RGBColor(70, 50, 126),
    RGBColor(54, 92, 141),
    RGBColor(39, 127, 142),
    RGBColor(31, 161, 135),
    RGBColor(74, 193, 109),
    RGBColor(160, 218, 57),
    RGBColor(253, 231, 37),
];

fn palette_color(index: usize, len: usize) -> RGBColor {
    if len <= 1 {
        return PALETTE[0];
    }
    let scaled = index * (PALETTE.len() - 1) / (len - 1);
    PALETTE[scaled.min(PALETTE.len() - 1)]
}

fn draw_err<E: std::fmt::Display>(what: &'static str) -> impl Fn(E) -> anyhow::Error {
    move |err| anyhow!("Failed drawing {what}: {err}")
}

/// Number of codes at each depth, ascending by depth.
pub fn depth_counts(records: &[FlatRecord]) -> BTreeMap<usize, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        *counts.entry(record.depth).or_insert(0) += 1;
    }
    counts
}

pub fn render_depth_chart(records: &[FlatRecord], size: (u32, u32)) -> Result<String> {
    let counts = depth_counts(records);
    let max_depth = counts.keys().next_back().copied().unwrap_or(0) as u32;
    let max_count = counts.values().copied().max().unwrap_or(0) as u32;

    let mut svg = String::new();
    {
        let root = SVGBackend::with_string(&mut svg, size).into_drawing_area();
        root.fill(&WHITE).map_err(draw_err("depth chart"))?;

        let mut chart = ChartBuilder::on(&root)
            .caption(
                "Distribution of Diagnostic Codes by Hierarchy Depth",
                ("sans-serif", 24),
            )
            .margin(20)
            .x_label_area_size(45)
            .y_label_area_size(60)
            .build_cartesian_2d(
                (0u32..max_depth + 1).into_segmented(),
                0u32..(max_count + max_count / 10 + 1),
            )
            .map_err(draw_err("depth chart"))?;

        chart
            .configure_mesh()
            .disable_x_mesh()
            .x_desc("Hierarchy depth")
            .y_desc("Number of codes")
            .draw()
            .map_err(draw_err("depth chart axes"))?;

        let bars = counts.len();
        chart
            .draw_series(counts.iter().enumerate().map(|(idx, (&depth, &count))| {
                let depth = depth as u32;
                let mut bar = Rectangle::new(
                    [
                        (SegmentValue::Exact(depth), 0),
                        (SegmentValue::Exact(depth + 1), count as u32),
                    ],
                    palette_color(idx, bars).filled(),
                );
                bar.set_margin(0, 0, 8, 8);
                bar
            }))
            .map_err(draw_err("depth chart bars"))?;

        chart
            .draw_series(counts.iter().map(|(&depth, &count)| {
                Text::new(
                    count.to_string(),
                    (SegmentValue::CenterOf(depth as u32), count as u32),
                    ("sans-serif", 14),
                )
            }))
            .map_err(draw_err("depth chart labels"))?;

        root.present().map_err(draw_err("depth chart"))?;
    }
    Ok(svg)
}

/// ICD-10 block of a code, e.g. `F32.1` -> `F32`. Codes that do not start with
/// letter-digit-digit (chapters, ranges like `F30-F39`) have no block.
pub fn code_block(code: &str) -> Option<&str> {
    let bytes = code.as_bytes();
    if bytes.len() < 3
        || !bytes[0].is_ascii_uppercase()
        || !bytes[1].is_ascii_digit()
        || !bytes[2].is_ascii_digit()
    {
        return None;
    }
    if bytes.get(3).is_some_and(|b| *b == b'-') {
        return None;
    }
    Some(&code[..3])
}

pub fn block_counts(records: &[FlatRecord]) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for record in records {
        if let Some(block) = code_block(&record.code) {
            *counts.entry(block).or_insert(0) += 1;
        }
    }
    let mut out: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(block, count)| (block.to_string(), count))
        .collect();
    out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    out
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Rect {
    fn area(&self) -> f64 {
        self.w * self.h
    }
}

fn worst_ratio(row: &[f64], side: f64) -> f64 {
    let sum: f64 = row.iter().sum();
    let max = row.iter().copied().fold(f64::MIN, f64::max);
    let min = row.iter().copied().fold(f64::MAX, f64::min);
    let side2 = side * side;
    let sum2 = sum * sum;
    (side2 * max / sum2).max(sum2 / (side2 * min))
}

/// Squarified treemap layout. `values` must be sorted descending; non-positive
/// values get no rectangle. Output is in input order for the positive values.
pub fn squarify(values: &[f64], bounds: Rect) -> Vec<Rect> {
    let positive: Vec<f64> = values.iter().copied().filter(|v| *v > 0.0).collect();
    let total: f64 = positive.iter().sum();
    if positive.is_empty() || bounds.area() <= 0.0 {
        return Vec::new();
    }
    let scale = bounds.area() / total;
    let areas: Vec<f64> = positive.iter().map(|v| v * scale).collect();

    let mut out = Vec::with_capacity(areas.len());
    let mut free = bounds;
    let mut start = 0;
    while start < areas.len() {
        let side = free.w.min(free.h);
        let mut end = start + 1;
        while end < areas.len()
            && worst_ratio(&areas[start..=end], side) <= worst_ratio(&areas[start..end], side)
        {
            end += 1;
        }

        let row = &areas[start..end];
        let row_sum: f64 = row.iter().sum();
        if free.w >= free.h {
            let col_w = row_sum / free.h;
            let mut y = free.y;
            for area in row {
                let h = area / col_w;
                out.push(Rect { x: free.x, y, w: col_w, h });
                y += h;
            }
            free.x += col_w;
            free.w -= col_w;
        } else {
            let row_h = row_sum / free.w;
            let mut x = free.x;
            for area in row {
                let w = area / row_h;
                out.push(Rect { x, y: free.y, w, h: row_h });
                x += w;
            }
            free.y += row_h;
            free.h -= row_h;
        }
        start = end;
    }
    out
}

pub fn render_block_treemap(records: &[FlatRecord], size: (u32, u32)) -> Result<String> {
    let blocks = block_counts(records);
    let values: Vec<f64> = blocks.iter().map(|(_, count)| *count as f64).collect();

    let mut svg = String::new();
    {
        let root = SVGBackend::with_string(&mut svg, size).into_drawing_area();
        root.fill(&WHITE).map_err(draw_err("treemap"))?;
        let root = root
            .titled("Diagnostic Codes by Block", ("sans-serif", 24))
            .map_err(draw_err("treemap title"))?;
        let (width, height) = root.dim_in_pixel();

        let bounds = Rect {
            x: 10.0,
            y: 10.0,
            w: width as f64 - 20.0,
            h: height as f64 - 20.0,
        };
        let cells = squarify(&values, bounds);
        for (idx, ((block, count), cell)) in blocks.iter().zip(&cells).enumerate() {
            let top_left = (cell.x.round() as i32, cell.y.round() as i32);
            let bottom_right = (
                (cell.x + cell.w).round() as i32,
                (cell.y + cell.h).round() as i32,
            );
            root.draw(&Rectangle::new(
                [top_left, bottom_right],
                palette_color(idx, blocks.len()).mix(0.8).filled(),
            ))
            .map_err(draw_err("treemap cell"))?;
            root.draw(&Rectangle::new([top_left, bottom_right], WHITE.stroke_width(2)))
                .map_err(draw_err("treemap cell border"))?;
            if cell.w >= 40.0 && cell.h >= 18.0 {
                root.draw(&Text::new(
                    format!("{block} ({count})"),
                    (top_left.0 + 4, top_left.1 + 4),
                    ("sans-serif", 12).into_font().color(&BLACK),
                ))
                .map_err(draw_err("treemap label"))?;
            }
        }
        root.present().map_err(draw_err("treemap"))?;
    }
    Ok(svg)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlacedNode {
    pub code: String,
    pub depth: usize,
    /// Radians, measured clockwise from the positive x axis.
    pub angle: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkLayout {
    pub nodes: Vec<PlacedNode>,
    /// Parent index -> child index into `nodes`.
    pub edges: Vec<(usize, usize)>,
    pub total_nodes: usize,
}

/// Radial layout of at most `max_nodes` nodes, taken breadth-first so shallow
/// levels are kept whole before deeper ones. Each node gets an angular wedge
/// proportional to the number of kept leaves below it.
pub fn radial_layout(tree: &CodeNode, max_nodes: usize) -> NetworkLayout {
    let max_nodes = max_nodes.max(1);
    let mut kept: Vec<(&CodeNode, Option<usize>, usize)> = Vec::new();
    let mut queue: VecDeque<(&CodeNode, Option<usize>, usize)> =
        VecDeque::from([(tree, None, 0)]);
    while let Some(entry) = queue.pop_front() {
        if kept.len() == max_nodes {
            break;
        }
        let idx = kept.len();
        kept.push(entry);
        let (node, _, depth) = entry;
        for child in &node.children {
            queue.push_back((child, Some(idx), depth + 1));
        }
    }

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); kept.len()];
    for (idx, (_, parent, _)) in kept.iter().enumerate() {
        if let Some(parent) = parent {
            children[*parent].push(idx);
        }
    }

    let mut weight = vec![0usize; kept.len()];
    for idx in (0..kept.len()).rev() {
        weight[idx] = if children[idx].is_empty() {
            1
        } else {
            children[idx].iter().map(|c| weight[*c]).sum()
        };
    }

    let mut wedge = vec![(0.0f64, TAU); kept.len()];
    for idx in 0..kept.len() {
        let (start, span) = wedge[idx];
        let mut offset = start;
        for &child in &children[idx] {
            let child_span = span * weight[child] as f64 / weight[idx] as f64;
            wedge[child] = (offset, child_span);
            offset += child_span;
        }
    }

    let nodes = kept
        .iter()
        .zip(&wedge)
        .map(|((node, _, depth), (start, span))| PlacedNode {
            code: node.code.clone(),
            depth: *depth,
            angle: if *depth == 0 { 0.0 } else { start + span / 2.0 },
        })
        .collect();
    let edges = kept
        .iter()
        .enumerate()
        .filter_map(|(idx, (_, parent, _))| parent.map(|p| (p, idx)))
        .collect();

    NetworkLayout {
        nodes,
        edges,
        total_nodes: tree.node_count(),
    }
}

/// A node ready for the radial renderer: ring 0 is the center.
struct RadialPoint {
    label: String,
    ring: usize,
    angle: f64,
    color: RGBColor,
    radius: i32,
    show_label: bool,
}

fn draw_radial(
    title: &str,
    points: &[RadialPoint],
    edges: &[(usize, usize)],
    size: (u32, u32),
) -> Result<String> {
    let rings = points.iter().map(|p| p.ring).max().unwrap_or(0).max(1);

    let mut svg = String::new();
    {
        let root = SVGBackend::with_string(&mut svg, size).into_drawing_area();
        root.fill(&WHITE).map_err(draw_err("graph"))?;
        let root = root
            .titled(title, ("sans-serif", 24))
            .map_err(draw_err("graph title"))?;

        let (width, height) = root.dim_in_pixel();
        let center = (width as f64 / 2.0, height as f64 / 2.0);
        let ring_width = (center.0.min(center.1) - 30.0).max(10.0) / rings as f64;
        let position = |point: &RadialPoint| -> (i32, i32) {
            let radius = ring_width * point.ring as f64;
            (
                (center.0 + radius * point.angle.cos()).round() as i32,
                (center.1 + radius * point.angle.sin()).round() as i32,
            )
        };

        for &(from, to) in edges {
            let line = vec![position(&points[from]), position(&points[to])];
            root.draw(&PathElement::new(line, RGBColor(160, 160, 160).stroke_width(1)))
                .map_err(draw_err("graph edge"))?;
        }

        for point in points {
            let at = position(point);
            root.draw(&Circle::new(at, point.radius, point.color.filled()))
                .map_err(draw_err("graph node"))?;
            if point.show_label {
                root.draw(&Text::new(
                    point.label.clone(),
                    (at.0 + 6, at.1 - 6),
                    ("sans-serif", 10),
                ))
                .map_err(draw_err("graph label"))?;
            }
        }
        root.present().map_err(draw_err("graph"))?;
    }
    Ok(svg)
}

pub fn render_network(tree: &CodeNode, max_nodes: usize, size: (u32, u32)) -> Result<String> {
    let layout = radial_layout(tree, max_nodes);
    let max_depth = layout.nodes.iter().map(|n| n.depth).max().unwrap_or(0);
    let title = if layout.nodes.len() < layout.total_nodes {
        format!(
            "Diagnostic Code Hierarchy Network ({} of {} codes)",
            layout.nodes.len(),
            layout.total_nodes
        )
    } else {
        "Diagnostic Code Hierarchy Network".to_string()
    };

    let few = layout.nodes.len() <= 60;
    let points: Vec<RadialPoint> = layout
        .nodes
        .iter()
        .map(|node| RadialPoint {
            label: node.code.clone(),
            ring: node.depth,
            angle: node.angle,
            color: palette_color(node.depth, max_depth + 1),
            radius: if node.depth == 0 { 8 } else { 4 },
            show_label: node.depth <= 1 || few,
        })
        .collect();
    draw_radial(&title, &points, &layout.edges, size)
}

const CENTER_COLOR: RGBColor = RGBColor(214, 39, 40);
const NEAR_COLOR: RGBColor = RGBColor(173, 216, 230);
const FAR_COLOR: RGBColor = RGBColor(200, 200, 200);

fn short_name(name: &str) -> String {
    if name.chars().count() > 20 {
        let head: String = name.chars().take(17).collect();
        format!("{head}...")
    } else {
        name.to_string()
    }
}

/// Codes of a relationship report on rings by distance, linked where the graph
/// links them. The center code is red, distance 1 light blue, the rest gray.
pub fn render_relationship_graph(
    report: &RelationReport,
    graph: &CodeGraph,
    size: (u32, u32),
) -> Result<String> {
    let mut per_ring: BTreeMap<usize, usize> = BTreeMap::new();
    for related in &report.related {
        *per_ring.entry(related.distance).or_insert(0) += 1;
    }

    let few = report.related.len() <= 60;
    let mut placed: BTreeMap<usize, usize> = BTreeMap::new();
    let points: Vec<RadialPoint> = report
        .related
        .iter()
        .map(|related| {
            let ring = related.distance;
            let slot = placed.entry(ring).or_insert(0);
            let count = per_ring.get(&ring).copied().unwrap_or(1).max(1);
            let angle = TAU * (*slot as f64 + 0.5 * (ring % 2) as f64) / count as f64;
            *slot += 1;

            let name = related.name.as_deref().unwrap_or_default();
            let label = if name.is_empty() {
                related.code.clone()
            } else {
                format!("{} {}", related.code, short_name(name))
            };
            RadialPoint {
                label,
                ring,
                angle,
                color: match ring {
                    0 => CENTER_COLOR,
                    1 => NEAR_COLOR,
                    _ => FAR_COLOR,
                },
                radius: if ring == 0 { 9 } else { 5 },
                show_label: ring <= 1 || few,
            }
        })
        .collect();

    let codes: Vec<&str> = report.related.iter().map(|r| r.code.as_str()).collect();
    let edges = graph.links_among(&codes);
    let title = if report.details.name.is_empty() {
        format!("Relationships for {}", report.code)
    } else {
        format!("Relationships for {}: {}", report.code, report.details.name)
    };
    draw_radial(&title, &points, &edges, size)
}
