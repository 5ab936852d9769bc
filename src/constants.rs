pub const DEFAULT_HIERARCHY_BASE_URL: &str = "https://fat.kote.helsedirektoratet.no/api/code-systems";
pub const DEFAULT_SEARCH_URL: &str = "https://fs-elastic-prod.ent.westeurope.azure.elastic-cloud.com/api/as/v1/engines/ehelse-kodeverk-prod/search.json";

pub const FINNKODE_SITE_URL: &str = "https://finnkode.helsedirektoratet.no";

pub const DEFAULT_CODE_SYSTEM: &str = "icd10";
/// Chapter V of ICD-10 (mental and behavioural disorders, F00-F99).
pub const DEFAULT_ROOT_CODE: &str = "V";

pub const DEFAULT_OUTPUT_DIR: &str = "output";
pub const DEFAULT_VIZ_DIR: &str = "visualizations";

pub const HIERARCHY_FILE_STEM: &str = "complete_hierarchy";

pub const USER_AGENT: &str = "finnkode-fetcher/0.1";
