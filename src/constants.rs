/// Pipeline-wide constants shared by stages, stores and the CLI
use std::time::Duration;

// Download policy
pub const MAX_DOWNLOAD_ATTEMPTS: usize = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;
pub const DOWNLOAD_CHUNK_SIZE: usize = 1024 * 1024;

// Fetch defaults
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 20;

// Dedup
pub const FINGERPRINT_TITLE_CHARS: usize = 100;

// Page enrichment considers anything at or below this length empty
pub const MIN_PAGE_TEXT_CHARS: usize = 50;

// Binary processing defaults
pub const DEFAULT_MAX_PAGES: usize = 10;
pub const DEFAULT_FRAGMENT_MAX_CHARS: usize = 200;
pub const DEFAULT_TEXT_MAX_CHARS: usize = 2_000;
pub const DEFAULT_CHUNK_HEAD_CHARS: usize = 1_000;
pub const DEFAULT_CHUNK_TAIL_CHARS: usize = 1_000;
pub const DEFAULT_OCR_LANG: &str = "rus+eng";
pub const OCR_DPI: u32 = 300;

// Dry-run preview width
pub const PREVIEW_CHARS: usize = 200;

// Context keys written by the stages
pub const KEY_DOCUMENT: &str = "document";
pub const KEY_SOURCE_URL: &str = "source_url";
pub const KEY_DOWNLOAD_STATS: &str = "download_stats";
pub const KEY_PROCESSING_STATS: &str = "processing_stats";
pub const KEY_NORMALIZE_STATS: &str = "normalize_stats";
pub const KEY_PERSIST_STATS: &str = "persist_stats";
pub const KEY_ENRICH_STATS: &str = "enrich_stats";
pub const KEY_ALERT: &str = "alert";

// Environment overrides
pub const ENV_FRAGMENT_MAX: &str = "SOURCEWATCH_FRAGMENT_MAX";
pub const ENV_TEXT_MAX: &str = "SOURCEWATCH_TEXT_MAX";
pub const ENV_CHUNK_HEAD: &str = "SOURCEWATCH_CHUNK_HEAD";
pub const ENV_CHUNK_TAIL: &str = "SOURCEWATCH_CHUNK_TAIL";
pub const ENV_LLM_URL: &str = "SOURCEWATCH_LLM_URL";
pub const ENV_LLM_MODEL: &str = "SOURCEWATCH_LLM_MODEL";
pub const ENV_LLM_API_KEY: &str = "SOURCEWATCH_LLM_API_KEY";

pub const DEFAULT_STATE_DIR: &str = "data";
pub const STATE_DB_FILE: &str = "state.db";

/// Per-operation busy timeout for SQLite handles
pub const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
