use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::constants::{
    DEFAULT_CODE_SYSTEM, DEFAULT_HIERARCHY_BASE_URL, DEFAULT_OUTPUT_DIR, DEFAULT_ROOT_CODE,
    DEFAULT_SEARCH_URL, DEFAULT_VIZ_DIR,
};

#[derive(Debug, Parser)]
#[command(name = "finnkode_fetcher")]
#[command(about = "Fetch, export and visualize diagnostic code hierarchies from the Finnkode API")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Directory for JSON, CSV, XLSX and Parquet exports.
    #[arg(long, global = true, default_value = DEFAULT_OUTPUT_DIR)]
    pub output_dir: PathBuf,

    /// Directory for charts and the interactive sunburst page.
    #[arg(long, global = true, default_value = DEFAULT_VIZ_DIR)]
    pub viz_dir: PathBuf,

    /// Code system segment of the hierarchy endpoints (icd10, icpc2, ...).
    #[arg(long, global = true, default_value = DEFAULT_CODE_SYSTEM)]
    pub code_system: String,

    /// Hierarchy API base URL.
    #[arg(
        long,
        global = true,
        env = "FINNKODE_HIERARCHY_URL",
        default_value = DEFAULT_HIERARCHY_BASE_URL
    )]
    pub hierarchy_url: String,

    /// Search endpoint URL.
    #[arg(long, global = true, env = "FINNKODE_SEARCH_URL", default_value = DEFAULT_SEARCH_URL)]
    pub search_url: String,

    /// Bearer token for the search endpoint.
    #[arg(long, global = true, env = "FINNKODE_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// Per-request timeout in seconds.
    #[arg(long, global = true, default_value_t = 30)]
    pub timeout_seconds: u64,

    /// Max attempts per lookup, counting the first one.
    #[arg(long, global = true, default_value_t = 5)]
    pub max_retries: u32,

    /// Global request start rate. 0 disables spacing.
    #[arg(long, global = true, default_value_t = 5)]
    pub requests_per_second: u32,

    /// SQLite cache database for lookup results. Defaults to <output-dir>/cache/lookups.sqlite.
    #[arg(long, global = true)]
    pub cache_db: Option<PathBuf>,

    /// Keep lookups in memory only.
    #[arg(long, global = true, default_value_t = false, conflicts_with = "cache_db")]
    pub no_cache: bool,

    /// Delete the cache database before starting.
    #[arg(long, global = true, default_value_t = false)]
    pub reset_cache: bool,

    /// Skip API requests and only use existing cache entries.
    #[arg(long, global = true, default_value_t = false)]
    pub skip_api: bool,

    /// Hide progress bars.
    #[arg(long, global = true, default_value_t = false)]
    pub no_progress: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Csv,
    Xlsx,
    Parquet,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch the hierarchy below a code, export it and render charts.
    Hierarchy {
        /// Root code to expand.
        #[arg(long, default_value = DEFAULT_ROOT_CODE)]
        code: String,

        /// Maximum depth below the root.
        #[arg(long, default_value_t = 5)]
        depth: usize,

        /// Max children lookups in flight per level.
        #[arg(long, default_value_t = 10)]
        batch: usize,

        /// Tabular formats for the flattened codes.
        #[arg(long, value_enum, value_delimiter = ',', default_values = ["csv", "xlsx"])]
        formats: Vec<ExportFormat>,

        /// Skip chart rendering.
        #[arg(long, default_value_t = false)]
        no_visualize: bool,

        /// Cap on nodes drawn in the network chart.
        #[arg(long, default_value_t = 500)]
        max_network_nodes: usize,
    },

    /// Render charts from a saved hierarchy JSON without fetching.
    Visualize {
        /// Saved hierarchy. Defaults to the newest one in the output directory.
        #[arg(long)]
        input: Option<PathBuf>,

        /// Cap on nodes drawn in the network chart.
        #[arg(long, default_value_t = 500)]
        max_network_nodes: usize,
    },

    /// Show one code with its direct children.
    Code {
        code: String,

        /// Also write the code and its children to a JSON file.
        #[arg(long, default_value_t = false)]
        save: bool,
    },

    /// Fetch the server-side hierarchy document of a code system, category or code.
    Tree {
        #[arg(long)]
        category: Option<String>,

        /// Requires --category.
        #[arg(long, requires = "category")]
        code: Option<String>,
    },

    /// Free-text search across code systems.
    Search {
        query: String,

        /// Restrict hits to one code system (oid_system filter).
        #[arg(long)]
        system: Option<String>,

        #[arg(long, default_value_t = 50)]
        per_page: u32,

        #[arg(long, default_value_t = 10)]
        max_pages: u32,

        /// Also write an XLSX workbook next to the CSV.
        #[arg(long, default_value_t = false)]
        xlsx: bool,
    },

    /// Codes related to one code by hierarchy position or by references in
    /// inclusion and exclusion notes.
    Related {
        code: String,

        /// Maximum number of hops.
        #[arg(long, default_value_t = 2)]
        distance: usize,

        /// Saved hierarchy to analyze. Defaults to the newest one in the output directory.
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// One relationship report per two-character group of a chapter (`F0`,
    /// `F1`, ...), centered on the first code of each group.
    Clusters {
        /// Chapter letter whose codes are grouped.
        #[arg(long, default_value = "F")]
        chapter: String,

        #[arg(long, default_value_t = 2)]
        distance: usize,

        /// Saved hierarchy to analyze. Defaults to the newest one in the output directory.
        #[arg(long)]
        input: Option<PathBuf>,
    },
}
