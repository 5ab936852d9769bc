//! Recursive hierarchy fetching.
//!
//! The tree is expanded one level at a time. Each level issues one children
//! lookup per expandable node with at most `batch_size` lookups in flight; the
//! results are attached only after the whole level has completed, in frontier
//! order, so the shape of the tree never depends on response timing.

use futures::{StreamExt, stream::FuturesUnordered};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, warn};

use crate::{
    error::FailureKind,
    model::{ApiCode, CodeNode, LookupFailure},
    retry::{Attempted, RetryPolicy, with_backoff},
    source::CodeSource,
};

#[derive(Debug, Clone)]
pub struct WalkOptions {
    pub max_depth: usize,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub show_progress: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            max_depth: 5,
            batch_size: 10,
            retry: RetryPolicy::default(),
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupTarget {
    Details,
    Children,
}

impl LookupTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            LookupTarget::Details => "details",
            LookupTarget::Children => "children",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedLookup {
    pub code: String,
    pub target: LookupTarget,
    pub depth: usize,
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct HierarchyReport {
    pub root: CodeNode,
    pub failures: Vec<FailedLookup>,
    pub requests: usize,
    pub duplicates_skipped: usize,
}

/// Node under construction: the node itself (children still empty) plus
/// arena indices of its children.
struct Slot {
    node: CodeNode,
    depth: usize,
    children: Vec<usize>,
}

pub async fn fetch_hierarchy<S: CodeSource>(
    source: &S,
    root_code: &str,
    options: &WalkOptions,
) -> HierarchyReport {
    let root_code = root_code.trim();
    let batch_size = options.batch_size.max(1);

    let mut failures = Vec::new();
    let mut requests = 0usize;
    let mut duplicates_skipped = 0usize;

    let mut root = CodeNode::new(root_code);
    let details = with_backoff(&options.retry, root_code, || source.details(root_code)).await;
    requests += details.attempts as usize;
    match details.result {
        Ok(record) => root.apply_details(&record),
        Err(err) => {
            warn!(code = root_code, error = %err, "root details lookup failed");
            failures.push(FailedLookup {
                code: root_code.to_string(),
                target: LookupTarget::Details,
                depth: 0,
                kind: err.kind(),
                message: err.to_string(),
                attempts: details.attempts,
            });
        }
    }

    let mut slots = vec![Slot {
        node: root,
        depth: 0,
        children: Vec::new(),
    }];
    let mut visited: HashSet<String> = HashSet::from([root_code.to_string()]);
    let mut frontier = vec![0usize];

    for depth in 0..options.max_depth {
        let expandable: Vec<usize> = frontier
            .iter()
            .copied()
            .filter(|&idx| !slots[idx].node.reported_leaf)
            .collect();
        if expandable.is_empty() {
            break;
        }

        info!(
            level = depth + 1,
            max_depth = options.max_depth,
            nodes = expandable.len(),
            "expanding hierarchy level"
        );
        let progress = level_progress(options.show_progress, depth + 1, expandable.len());

        let pending: Vec<(usize, String)> = expandable
            .into_iter()
            .map(|idx| (idx, slots[idx].node.code.clone()))
            .collect();
        let mut queue = pending.into_iter();
        let mut in_flight = FuturesUnordered::new();
        for _ in 0..batch_size {
            if let Some((idx, code)) = queue.next() {
                in_flight.push(lookup_children(source, &options.retry, idx, code));
            }
        }

        let mut completed: Vec<(usize, Attempted<Vec<ApiCode>>)> = Vec::new();
        while let Some(done) = in_flight.next().await {
            completed.push(done);
            progress.inc(1);
            if let Some((idx, code)) = queue.next() {
                in_flight.push(lookup_children(source, &options.retry, idx, code));
            }
        }
        progress.finish_and_clear();

        completed.sort_by_key(|(idx, _)| *idx);
        let mut next_frontier = Vec::new();
        for (parent_idx, attempted) in completed {
            requests += attempted.attempts as usize;
            match attempted.result {
                Ok(records) => {
                    for record in &records {
                        let child = CodeNode::from_api(record);
                        if child.code.is_empty() {
                            continue;
                        }
                        if !visited.insert(child.code.clone()) {
                            duplicates_skipped += 1;
                            continue;
                        }
                        let child_idx = slots.len();
                        slots.push(Slot {
                            node: child,
                            depth: depth + 1,
                            children: Vec::new(),
                        });
                        slots[parent_idx].children.push(child_idx);
                        next_frontier.push(child_idx);
                    }
                }
                Err(err) => {
                    let slot = &mut slots[parent_idx];
                    warn!(
                        code = %slot.node.code,
                        kind = %err.kind(),
                        attempts = attempted.attempts,
                        error = %err,
                        "children lookup failed, keeping node as leaf"
                    );
                    failures.push(FailedLookup {
                        code: slot.node.code.clone(),
                        target: LookupTarget::Children,
                        depth: slot.depth,
                        kind: err.kind(),
                        message: err.to_string(),
                        attempts: attempted.attempts,
                    });
                    slot.node.error = Some(LookupFailure::from_error(&err, attempted.attempts));
                }
            }
        }
        frontier = next_frontier;
    }

    info!(
        nodes = slots.len(),
        failures = failures.len(),
        requests,
        duplicates_skipped,
        "hierarchy fetch finished"
    );

    HierarchyReport {
        root: assemble(slots),
        failures,
        requests,
        duplicates_skipped,
    }
}

async fn lookup_children<S: CodeSource>(
    source: &S,
    policy: &RetryPolicy,
    idx: usize,
    code: String,
) -> (usize, Attempted<Vec<ApiCode>>) {
    let attempted = with_backoff(policy, &code, || source.children(&code)).await;
    (idx, attempted)
}

/// Moves arena slots into an owned tree. Children always have larger indices
/// than their parent, so walking backwards finishes every child before its
/// parent is taken.
fn assemble(slots: Vec<Slot>) -> CodeNode {
    let mut nodes: Vec<Option<CodeNode>> = Vec::with_capacity(slots.len());
    let mut child_lists = Vec::with_capacity(slots.len());
    for slot in slots {
        nodes.push(Some(slot.node));
        child_lists.push(slot.children);
    }

    for idx in (0..nodes.len()).rev() {
        let children: Vec<CodeNode> = child_lists[idx]
            .iter()
            .filter_map(|&child| nodes[child].take())
            .collect();
        if let Some(node) = nodes[idx].as_mut() {
            node.children = children;
        }
    }
    nodes
        .into_iter()
        .next()
        .flatten()
        .unwrap_or_else(|| CodeNode::new(""))
}

fn level_progress(enabled: bool, level: usize, len: usize) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let progress = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [level {msg} {elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}",
    ) {
        progress.set_style(style.progress_chars("=> "));
    }
    progress.set_message(level.to_string());
    progress
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LookupError;
    use std::{
        collections::HashMap,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };
    use tokio::time::Instant;

    #[derive(Clone, Copy)]
    enum Fault {
        /// Time out this many times, then answer normally.
        TimeoutTimes(u32),
        Status(u16),
    }

    /// In-memory code API: parent code -> child codes.
    #[derive(Default)]
    struct FixtureApi {
        children: HashMap<String, Vec<String>>,
        faults: HashMap<String, Fault>,
        calls: Mutex<HashMap<String, u32>>,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
        latency: Option<Duration>,
    }

    impl FixtureApi {
        fn with_edges(edges: &[(&str, &[&str])]) -> Self {
            let children = edges
                .iter()
                .map(|(parent, kids)| {
                    (
                        parent.to_string(),
                        kids.iter().map(|k| k.to_string()).collect(),
                    )
                })
                .collect();
            Self {
                children,
                ..Self::default()
            }
        }

        fn fault(mut self, code: &str, fault: Fault) -> Self {
            self.faults.insert(code.to_string(), fault);
            self
        }

        fn calls_for(&self, code: &str) -> u32 {
            self.calls.lock().unwrap().get(code).copied().unwrap_or(0)
        }

        fn record_call(&self, code: &str) -> u32 {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(code.to_string()).or_default();
            *n += 1;
            *n
        }
    }

    impl CodeSource for FixtureApi {
        async fn details(&self, code: &str) -> Result<ApiCode, LookupError> {
            Ok(ApiCode {
                code_value: code.to_string(),
                name_norwegian: Some(format!("Navn {code}")),
                active: Some(true),
                ..ApiCode::default()
            })
        }

        async fn children(&self, code: &str) -> Result<Vec<ApiCode>, LookupError> {
            let call = self.record_call(code);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match self.faults.get(code) {
                Some(Fault::TimeoutTimes(n)) if call <= *n => {
                    return Err(LookupError::Timeout {
                        url: format!("fixture://{code}/children"),
                    });
                }
                Some(Fault::Status(status)) => {
                    return Err(LookupError::Status {
                        url: format!("fixture://{code}/children"),
                        status: *status,
                        retry_after: None,
                        body: "bad request".into(),
                    });
                }
                _ => {}
            }

            Ok(self
                .children
                .get(code)
                .map(|kids| {
                    kids.iter()
                        .map(|kid| ApiCode {
                            code_value: kid.clone(),
                            name_norwegian: Some(format!("Navn {kid}")),
                            active: Some(true),
                            ..ApiCode::default()
                        })
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    fn chapter_v() -> FixtureApi {
        FixtureApi::with_edges(&[
            ("V", &["F30-F39", "F40-F48"]),
            ("F30-F39", &["F32", "F33"]),
            ("F32", &["F32.0", "F32.1", "F32.2", "F32.3", "F32.8"]),
            ("F33", &["F33.0", "F33.1"]),
            ("F40-F48", &["F41"]),
            ("F41", &["F41.0", "F41.1"]),
        ])
    }

    fn options(max_depth: usize, batch_size: usize) -> WalkOptions {
        WalkOptions {
            max_depth,
            batch_size,
            ..WalkOptions::default()
        }
    }

    fn assert_no_repeats_on_paths(node: &CodeNode, path: &mut Vec<String>) {
        assert!(
            !path.contains(&node.code),
            "{} repeats on path {:?}",
            node.code,
            path
        );
        path.push(node.code.clone());
        for child in &node.children {
            assert_no_repeats_on_paths(child, path);
        }
        path.pop();
    }

    #[tokio::test]
    async fn same_inputs_give_same_tree() {
        let api = chapter_v();
        let first = fetch_hierarchy(&api, "V", &options(5, 3)).await;
        let second = fetch_hierarchy(&api, "V", &options(5, 1)).await;

        assert_eq!(first.root.node_count(), 15);
        assert_eq!(first.root.node_count(), second.root.node_count());
        let mut a = first.root.codes();
        let mut b = second.root.codes();
        a.sort_unstable();
        b.sort_unstable();
        assert_eq!(a, b);
        assert_eq!(first.root, second.root);
        assert!(first.failures.is_empty());
        assert_eq!(first.root.name, "Navn V");
    }

    #[tokio::test]
    async fn depth_zero_returns_only_the_root() {
        let api = chapter_v();
        let report = fetch_hierarchy(&api, "F32", &options(0, 4)).await;
        assert_eq!(report.root.code, "F32");
        assert!(report.root.children.is_empty());
        assert_eq!(api.calls_for("F32"), 0);
    }

    #[tokio::test]
    async fn depth_bound_stops_expansion() {
        let api = chapter_v();
        let report = fetch_hierarchy(&api, "V", &options(2, 4)).await;
        assert_eq!(report.root.height(), 2);
        assert!(report.root.find("F32").is_some());
        assert!(report.root.find("F32.0").is_none());
        assert_eq!(api.calls_for("F32"), 0);
    }

    #[tokio::test]
    async fn cycles_and_repeated_codes_are_dropped() {
        let api = FixtureApi::with_edges(&[
            ("A", &["B", "C"]),
            ("B", &["A", "D"]),
            ("C", &["D", "C"]),
            ("D", &["B"]),
        ]);
        let report = fetch_hierarchy(&api, "A", &options(10, 2)).await;

        assert_no_repeats_on_paths(&report.root, &mut Vec::new());
        let mut codes = report.root.codes();
        codes.sort_unstable();
        assert_eq!(codes, vec!["A", "B", "C", "D"]);
        assert_eq!(report.duplicates_skipped, 4);
    }

    #[tokio::test]
    async fn client_error_marks_only_that_sibling() {
        let mut api = chapter_v().fault("F32.2", Fault::Status(400));
        for leaf in ["F32.0", "F32.1", "F32.2", "F32.3", "F32.8"] {
            api.children.insert(leaf.to_string(), vec![format!("{leaf}1")]);
        }
        let report = fetch_hierarchy(&api, "F32", &options(2, 5)).await;

        assert_eq!(report.root.children.len(), 5);
        for child in &report.root.children {
            if child.code == "F32.2" {
                let failure = child.error.as_ref().expect("failure marker");
                assert_eq!(failure.kind, FailureKind::Client);
                assert_eq!(failure.attempts, 1);
                assert!(child.children.is_empty());
            } else {
                assert!(child.error.is_none(), "{} should be intact", child.code);
                assert_eq!(child.children.len(), 1);
            }
        }
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].code, "F32.2");
        assert_eq!(report.failures[0].target, LookupTarget::Children);
        assert_eq!(api.calls_for("F32.2"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_retried_within_bounded_wait() {
        let api = chapter_v().fault("F32", Fault::TimeoutTimes(2));
        let opts = options(1, 2);
        let started = Instant::now();

        let report = fetch_hierarchy(&api, "F32", &opts).await;

        let codes: Vec<_> = report.root.children.iter().map(|c| c.code.as_str()).collect();
        assert_eq!(codes, vec!["F32.0", "F32.1", "F32.2", "F32.3", "F32.8"]);
        assert!(report.root.error.is_none());
        assert_eq!(api.calls_for("F32"), 3);
        assert!(started.elapsed() <= opts.retry.max_total_backoff());
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_timeouts_become_transient_failures() {
        let api = chapter_v().fault("F33", Fault::TimeoutTimes(u32::MAX));
        let mut opts = options(3, 4);
        opts.retry = RetryPolicy::with_attempts(3);

        let report = fetch_hierarchy(&api, "F30-F39", &opts).await;
        let f33 = report.root.find("F33").unwrap();
        let failure = f33.error.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::Transient);
        assert_eq!(failure.attempts, 3);
        assert_eq!(report.root.find("F32").unwrap().children.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_lookups_never_exceed_batch_size() {
        let mut api = FixtureApi::with_edges(&[(
            "R",
            &["C1", "C2", "C3", "C4", "C5", "C6", "C7", "C8", "C9"],
        )]);
        api.latency = Some(Duration::from_millis(50));

        let report = fetch_hierarchy(&api, "R", &options(2, 3)).await;
        assert_eq!(report.root.node_count(), 10);
        assert_eq!(api.peak_in_flight.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn leaf_hint_skips_lookup() {
        struct LeafApi;
        impl CodeSource for LeafApi {
            async fn details(&self, code: &str) -> Result<ApiCode, LookupError> {
                Ok(ApiCode {
                    code_value: code.to_string(),
                    ..ApiCode::default()
                })
            }
            async fn children(&self, code: &str) -> Result<Vec<ApiCode>, LookupError> {
                assert_eq!(code, "F32", "leaf children must not be requested");
                Ok(vec![ApiCode {
                    code_value: "F32.0".into(),
                    is_leaf_node: Some(true),
                    ..ApiCode::default()
                }])
            }
        }

        let report = fetch_hierarchy(&LeafApi, "F32", &options(5, 2)).await;
        assert_eq!(report.root.node_count(), 2);
        assert_eq!(report.requests, 2);
    }
}
