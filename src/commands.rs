use anyhow::{Context, Result, anyhow, bail};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{info, warn};

use crate::{
    args::{Args, Command, ExportFormat},
    cache::{CachedSource, LookupCache},
    client::{ApiClient, ClientConfig},
    common::{
        delete_if_exists, ensure_parent_dir, file_stem_for, latest_timestamped_file,
        now_unix_seconds, timestamped_path,
    },
    constants::HIERARCHY_FILE_STEM,
    export::{
        load_tree_json, write_failures_csv, write_records_csv, write_records_xlsx,
        write_relation_report_json, write_relation_report_xlsx, write_search_csv,
        write_search_xlsx, write_tree_json,
    },
    flatten::extract_all_codes,
    model::{CodeNode, FlatRecord},
    parquet_writer::write_records_parquet,
    relations::{CodeDetails, CodeGraph, RelationReport, group_by_prefix},
    retry::{RetryPolicy, with_backoff},
    source::CodeSource,
    visualize::{VisualizeOptions, render_all, write_relationship_graph},
    walker::{HierarchyReport, WalkOptions, fetch_hierarchy},
};

const CODES_FILE_STEM: &str = "diagnostic_codes";

pub async fn run(args: Args) -> Result<()> {
    match &args.command {
        Command::Hierarchy {
            code,
            depth,
            batch,
            formats,
            no_visualize,
            max_network_nodes,
        } => {
            let walk = WalkOptions {
                max_depth: *depth,
                batch_size: *batch,
                retry: retry_policy(&args),
                show_progress: !args.no_progress,
            };
            let viz = (!*no_visualize).then(|| VisualizeOptions {
                max_network_nodes: *max_network_nodes,
                ..VisualizeOptions::default()
            });
            run_hierarchy(&args, code, &walk, formats, viz.as_ref()).await
        }
        Command::Visualize {
            input,
            max_network_nodes,
        } => {
            let options = VisualizeOptions {
                max_network_nodes: *max_network_nodes,
                ..VisualizeOptions::default()
            };
            run_visualize(&args, input.as_deref(), &options)
        }
        Command::Code { code, save } => run_code(&args, code, *save).await,
        Command::Tree { category, code } => {
            run_tree(&args, category.as_deref(), code.as_deref()).await
        }
        Command::Search {
            query,
            system,
            per_page,
            max_pages,
            xlsx,
        } => run_search(&args, query, system.as_deref(), *per_page, *max_pages, *xlsx).await,
        Command::Related {
            code,
            distance,
            input,
        } => run_related(&args, code, *distance, input.as_deref()).await,
        Command::Clusters {
            chapter,
            distance,
            input,
        } => run_clusters(&args, chapter, *distance, input.as_deref()),
    }
}

fn retry_policy(args: &Args) -> RetryPolicy {
    RetryPolicy::with_attempts(args.max_retries)
}

fn api_client(args: &Args) -> Result<ApiClient> {
    ApiClient::new(ClientConfig {
        hierarchy_base_url: args.hierarchy_url.clone(),
        search_url: args.search_url.clone(),
        code_system: args.code_system.clone(),
        api_token: args.api_token.clone(),
        timeout: Duration::from_secs(args.timeout_seconds.max(1)),
        requests_per_second: args.requests_per_second,
    })
}

fn cache_db_path(args: &Args) -> PathBuf {
    args.cache_db
        .clone()
        .unwrap_or_else(|| args.output_dir.join("cache").join("lookups.sqlite"))
}

fn open_source(args: &Args) -> Result<CachedSource<ApiClient>> {
    let client = api_client(args)?;
    let code_system = client.code_system().to_string();

    let cache = if args.no_cache {
        LookupCache::open_in_memory()?
    } else {
        let path = cache_db_path(args);
        if args.reset_cache {
            for suffix in ["", "-wal", "-shm"] {
                delete_if_exists(Path::new(&format!("{}{suffix}", path.display())))?;
            }
            info!(path = %path.display(), "reset lookup cache");
        }
        ensure_parent_dir(&path)?;
        let cache = LookupCache::open(&path)?;
        info!(path = %path.display(), entries = cache.count()?, "opened lookup cache");
        cache
    };

    if args.skip_api {
        info!("API requests disabled; answering from cache only");
    }
    Ok(CachedSource::new(client, cache, &code_system, args.skip_api))
}

fn require_api(args: &Args, what: &str) -> Result<()> {
    if args.skip_api {
        bail!("{what} needs the API and cannot run with --skip-api");
    }
    Ok(())
}

fn log_report(report: &HierarchyReport, source: &CachedSource<ApiClient>) {
    let stats = report.root.stats();
    info!(
        root = %report.root.code,
        total = stats.total,
        parents = stats.parents,
        leaves = stats.leaves,
        inactive = stats.inactive,
        height = stats.height,
        requests = report.requests,
        duplicates_skipped = report.duplicates_skipped,
        cache_hits = source.hits(),
        cache_misses = source.misses(),
        "hierarchy fetched"
    );
    if !report.failures.is_empty() {
        warn!(
            failed_lookups = report.failures.len(),
            failed_nodes = stats.failed,
            "some lookups failed; affected nodes are marked in the exports"
        );
    }
}

fn export_records(
    records: &[FlatRecord],
    output_dir: &Path,
    formats: &[ExportFormat],
) -> Result<()> {
    for format in formats {
        match format {
            ExportFormat::Csv => {
                write_records_csv(records, &timestamped_path(output_dir, CODES_FILE_STEM, "csv"))?
            }
            ExportFormat::Xlsx => write_records_xlsx(
                records,
                &timestamped_path(output_dir, CODES_FILE_STEM, "xlsx"),
                "Diagnostic Codes",
            )?,
            ExportFormat::Parquet => {
                let path = timestamped_path(output_dir, CODES_FILE_STEM, "parquet");
                write_records_parquet(records, &path)?;
                info!(rows = records.len(), path = %path.display(), "wrote code Parquet");
            }
        }
    }
    Ok(())
}

fn visualize_tree(
    tree: &CodeNode,
    records: &[FlatRecord],
    viz_dir: &Path,
    options: &VisualizeOptions,
) -> Result<()> {
    let set = render_all(tree, records, viz_dir, options)?;
    if let Some(page) = &set.sunburst_page {
        println!("Interactive hierarchy: {}", page.display());
    }
    Ok(())
}

async fn run_hierarchy(
    args: &Args,
    root_code: &str,
    walk: &WalkOptions,
    formats: &[ExportFormat],
    viz: Option<&VisualizeOptions>,
) -> Result<()> {
    let source = open_source(args)?;
    info!(
        root = root_code,
        max_depth = walk.max_depth,
        batch_size = walk.batch_size,
        max_attempts = walk.retry.max_attempts,
        max_wait_per_lookup_secs = walk.retry.max_total_backoff().as_secs(),
        "fetching hierarchy"
    );
    let report = fetch_hierarchy(&source, root_code, walk).await;
    log_report(&report, &source);

    let tree_path = timestamped_path(&args.output_dir, HIERARCHY_FILE_STEM, "json");
    write_tree_json(&report.root, &tree_path)?;

    let records = extract_all_codes(&report.root);
    export_records(&records, &args.output_dir, formats)?;

    if !report.failures.is_empty() {
        let path = timestamped_path(&args.output_dir, "failed_lookups", "csv");
        write_failures_csv(&report.failures, &path)?;
    }

    if let Some(options) = viz {
        visualize_tree(&report.root, &records, &args.viz_dir, options)?;
    }

    println!(
        "Fetched {} codes below {} ({} failed lookups). Hierarchy saved to {}",
        records.len(),
        report.root.code,
        report.failures.len(),
        tree_path.display()
    );
    Ok(())
}

fn resolve_saved_tree(args: &Args, input: Option<&Path>) -> Result<PathBuf> {
    match input {
        Some(path) => Ok(path.to_path_buf()),
        None => latest_timestamped_file(&args.output_dir, HIERARCHY_FILE_STEM, "json")?
            .ok_or_else(|| {
                anyhow!(
                    "No saved hierarchy in {}; run the hierarchy command first or pass --input",
                    args.output_dir.display()
                )
            }),
    }
}

fn run_visualize(args: &Args, input: Option<&Path>, options: &VisualizeOptions) -> Result<()> {
    let path = resolve_saved_tree(args, input)?;
    info!(path = %path.display(), "visualizing saved hierarchy");
    let tree = load_tree_json(&path)?;
    let records = extract_all_codes(&tree);
    visualize_tree(&tree, &records, &args.viz_dir, options)
}

async fn run_code(args: &Args, code: &str, save: bool) -> Result<()> {
    let source = open_source(args)?;
    let retry = retry_policy(args);

    let details = with_backoff(&retry, code, || source.details(code))
        .await
        .result
        .with_context(|| format!("Failed looking up {code}"))?;
    let children = with_backoff(&retry, code, || source.children(code))
        .await
        .result
        .with_context(|| format!("Failed listing children of {code}"))?;

    let mut node = CodeNode::from_api(&details);
    node.children = children.iter().map(CodeNode::from_api).collect();

    println!("{}  {}  [{}]", node.code, node.name, node.status.as_str());
    if let Some(includes) = &node.includes {
        println!("  includes: {includes}");
    }
    if let Some(excludes) = &node.excludes {
        println!("  excludes: {excludes}");
    }
    for child in &node.children {
        let marker = if child.reported_leaf { "" } else { " +" };
        println!("  {}  {}{marker}", child.code, child.name);
    }

    if save {
        let stem = format!("code_{}", file_stem_for(&node.code));
        write_tree_json(&node, &timestamped_path(&args.output_dir, &stem, "json"))?;
    }
    Ok(())
}

async fn run_tree(args: &Args, category: Option<&str>, code: Option<&str>) -> Result<()> {
    require_api(args, "tree")?;
    let client = api_client(args)?;
    let retry = retry_policy(args);

    let outcome = with_backoff(&retry, "hierarchy", || client.hierarchy(category, code)).await;
    let payload = outcome
        .result
        .context("Failed fetching hierarchy document")?;

    let root_code = code.or(category).unwrap_or(client.code_system());
    let tree = CodeNode::from_hierarchy_document(payload, root_code)
        .context("Failed decoding hierarchy document")?;
    let stats = tree.stats();
    info!(
        root = %tree.code,
        total = stats.total,
        height = stats.height,
        "hierarchy document fetched"
    );

    let path = timestamped_path(&args.output_dir, HIERARCHY_FILE_STEM, "json");
    write_tree_json(&tree, &path)?;
    println!(
        "Saved {} codes (height {}) to {}",
        stats.total,
        stats.height,
        path.display()
    );
    Ok(())
}

async fn run_search(
    args: &Args,
    query: &str,
    system: Option<&str>,
    per_page: u32,
    max_pages: u32,
    xlsx: bool,
) -> Result<()> {
    require_api(args, "search")?;
    if args.api_token.is_none() {
        warn!("no API token set (FINNKODE_API_TOKEN); search requests will likely be refused");
    }
    let client = api_client(args)?;
    let hits = client
        .search_all(query, system, per_page, max_pages, &retry_policy(args))
        .await
        .with_context(|| format!("Search for {query:?} failed"))?;

    if hits.is_empty() {
        println!("No results for {query:?}");
        return Ok(());
    }

    let stem = format!("search_{}", file_stem_for(query));
    let csv_path = timestamped_path(&args.output_dir, &stem, "csv");
    write_search_csv(&hits, &csv_path)?;
    if xlsx {
        write_search_xlsx(
            &hits,
            &timestamped_path(&args.output_dir, &stem, "xlsx"),
            &format!("Search {query}"),
        )?;
    }

    for hit in hits.iter().take(20) {
        let code = hit.get("code").unwrap_or("-");
        let term = hit
            .get("term")
            .or_else(|| hit.get("name"))
            .unwrap_or_default();
        println!("{code}  {term}");
    }
    if hits.len() > 20 {
        println!("... {} more", hits.len() - 20);
    }
    println!("Saved {} results to {}", hits.len(), csv_path.display());
    Ok(())
}

async fn run_related(
    args: &Args,
    code: &str,
    distance: usize,
    input: Option<&Path>,
) -> Result<()> {
    let path = resolve_saved_tree(args, input)?;
    let tree = load_tree_json(&path)?;
    let records = extract_all_codes(&tree);
    let graph = CodeGraph::from_records(&records);
    info!(
        codes = graph.code_count(),
        reference_edges = graph.reference_edges(),
        path = %path.display(),
        "built relationship graph"
    );

    let mut details = details_from_records(&records, code);

    let source = open_source(args)?;
    let lookup = with_backoff(&retry_policy(args), code, || source.details(code)).await;
    match lookup.result {
        Ok(api) => {
            let fetched = CodeNode::from_api(&api);
            let entry = details.get_or_insert_with(|| CodeDetails {
                name: String::new(),
                status: fetched.status,
                parent: None,
                includes: None,
                excludes: None,
            });
            if !fetched.name.is_empty() {
                entry.name = fetched.name;
            }
            entry.status = fetched.status;
            entry.includes = fetched.includes.or(entry.includes.take());
            entry.excludes = fetched.excludes.or(entry.excludes.take());
        }
        Err(err) => warn!(code, error = %err, "details lookup failed; using saved hierarchy"),
    }
    let details = details.ok_or_else(|| {
        anyhow!(
            "{code} is neither in {} nor available from the API",
            path.display()
        )
    })?;

    if tree.find(code).is_none() {
        warn!(code, "code is not in the saved hierarchy; only its own details are reported");
    }

    let report = RelationReport::build(&graph, code, details, distance, now_unix_seconds());
    let stem = format!("{}_relationships", file_stem_for(code));
    let xlsx_path = write_relation_outputs(args, &report, &graph, &stem, &stem)?;

    println!("{}  {}", report.code, report.details.name);
    for hops in 1..=distance {
        let count = report.count_at(hops);
        if count > 0 {
            println!("  distance {hops}: {count} codes");
        }
    }
    println!("Report saved to {}", xlsx_path.display());
    Ok(())
}

fn details_from_records(records: &[FlatRecord], code: &str) -> Option<CodeDetails> {
    records.iter().find(|r| r.code == code).map(|r| CodeDetails {
        name: r.name.clone(),
        status: r.status,
        parent: r.parent_code.clone(),
        includes: r.includes.clone(),
        excludes: r.excludes.clone(),
    })
}

/// Writes the JSON and XLSX report to the output directory and the graph SVG
/// to the visualization directory. Returns the workbook path.
fn write_relation_outputs(
    args: &Args,
    report: &RelationReport,
    graph: &CodeGraph,
    report_stem: &str,
    graph_stem: &str,
) -> Result<PathBuf> {
    write_relation_report_json(report, &timestamped_path(&args.output_dir, report_stem, "json"))?;
    let xlsx_path = timestamped_path(&args.output_dir, report_stem, "xlsx");
    write_relation_report_xlsx(report, &xlsx_path)?;
    write_relationship_graph(report, graph, &timestamped_path(&args.viz_dir, graph_stem, "svg"))?;
    Ok(xlsx_path)
}

fn run_clusters(args: &Args, chapter: &str, distance: usize, input: Option<&Path>) -> Result<()> {
    let chapter = chapter.trim().to_uppercase();
    if chapter.is_empty() {
        bail!("--chapter must not be empty");
    }
    let path = resolve_saved_tree(args, input)?;
    let tree = load_tree_json(&path)?;
    let records = extract_all_codes(&tree);
    let graph = CodeGraph::from_records(&records);

    let groups = group_by_prefix(&records, &chapter);
    if groups.is_empty() {
        bail!("no {chapter} codes in {}", path.display());
    }
    info!(
        chapter = %chapter,
        groups = groups.len(),
        path = %path.display(),
        "analyzing code groups"
    );

    let generated_at = now_unix_seconds();
    for (group, codes) in &groups {
        let Some(representative) = codes.first() else {
            continue;
        };
        let Some(details) = details_from_records(&records, representative) else {
            continue;
        };
        let report = RelationReport::build(&graph, representative, details, distance, generated_at);
        let stem = file_stem_for(group);
        let xlsx_path = write_relation_outputs(
            args,
            &report,
            &graph,
            &format!("{stem}_analysis"),
            &format!("{stem}_relationships"),
        )?;
        println!(
            "{group}: {} codes, {representative} has {} related -> {}",
            codes.len(),
            report.related.len().saturating_sub(1),
            xlsx_path.display()
        );
    }
    Ok(())
}
