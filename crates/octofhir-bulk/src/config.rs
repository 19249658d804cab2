use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest part S3 accepts for every part but the last one.
pub const S3_MIN_PART_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BulkDataConfig {
    #[serde(default)]
    pub export: ExportSettings,
    #[serde(default)]
    pub import: ImportSettings,
    #[serde(default)]
    pub jobs: JobSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BulkDataConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Export validations
        if self.export.page_size == 0 {
            return Err("export.page_size must be > 0".into());
        }
        if self.export.part_upload_trigger_bytes == 0 {
            return Err("export.part_upload_trigger_bytes must be > 0".into());
        }
        if self.export.max_records_per_part == 0 {
            return Err("export.max_records_per_part must be > 0".into());
        }
        if self.export.patients_per_partition == 0 {
            return Err("export.patients_per_partition must be > 0".into());
        }
        if self.export.dedup_capacity == 0 {
            return Err("export.dedup_capacity must be > 0".into());
        }
        if self.storage.s3.is_some() && self.export.part_upload_trigger_bytes < S3_MIN_PART_BYTES
        {
            return Err(format!(
                "export.part_upload_trigger_bytes must be >= {S3_MIN_PART_BYTES} when storage.s3 is configured"
            ));
        }
        // Import validations
        if self.import.batch_size == 0 {
            return Err("import.batch_size must be > 0".into());
        }
        if self.import.matrix_splitting && self.import.segment_bytes == 0 {
            return Err("import.segment_bytes must be > 0 when matrix_splitting is on".into());
        }
        // Job validations
        if !(1..=64).contains(&self.jobs.max_concurrent_partitions) {
            return Err("jobs.max_concurrent_partitions must be within 1..=64".into());
        }
        if self.jobs.retry_backoff_ms > self.jobs.max_backoff_ms {
            return Err("jobs.retry_backoff_ms must be <= jobs.max_backoff_ms".into());
        }
        // Storage validations
        if let Some(ref s3) = self.storage.s3 {
            if s3.bucket.is_empty() {
                return Err("storage.s3.bucket must not be empty".into());
            }
        }
        if let Some(ref azure) = self.storage.azure {
            if azure.container.is_empty() {
                return Err("storage.azure.container must not be empty".into());
            }
            if azure.account.is_empty() && azure.endpoint.is_none() {
                return Err("storage.azure requires either 'account' or 'endpoint'".into());
            }
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSettings {
    /// Records fetched per search page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Buffered bytes that trigger a part upload.
    #[serde(default = "default_part_trigger")]
    pub part_upload_trigger_bytes: usize,
    /// Buffered records that trigger a part upload.
    #[serde(default = "default_records_per_part")]
    pub max_records_per_part: usize,
    /// Key prefix for export output objects.
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,
    /// Patients per compartment partition for Patient/Group exports.
    #[serde(default = "default_patients_per_partition")]
    pub patients_per_partition: usize,
    /// Logical ids remembered per partition to suppress duplicates.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

fn default_page_size() -> usize {
    1000
}
fn default_part_trigger() -> usize {
    10 * 1024 * 1024
}
fn default_records_per_part() -> usize {
    200_000
}
fn default_output_prefix() -> String {
    "exports".into()
}
fn default_patients_per_partition() -> usize {
    500
}
fn default_dedup_capacity() -> usize {
    100_000
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            part_upload_trigger_bytes: default_part_trigger(),
            max_records_per_part: default_records_per_part(),
            output_prefix: default_output_prefix(),
            patients_per_partition: default_patients_per_partition(),
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSettings {
    /// Records persisted per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Split large line-oriented sources into byte-range partitions.
    #[serde(default = "default_true")]
    pub matrix_splitting: bool,
    /// Target size of one byte-range partition.
    #[serde(default = "default_segment_bytes")]
    pub segment_bytes: u64,
}

fn default_batch_size() -> usize {
    1000
}
fn default_true() -> bool {
    true
}
fn default_segment_bytes() -> u64 {
    256 * 1024 * 1024
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            matrix_splitting: default_true(),
            segment_bytes: default_segment_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    #[serde(default = "default_max_concurrent_partitions")]
    pub max_concurrent_partitions: usize,
    /// Retries for a transient failure before the partition fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Per-record failure details kept per partition (all are counted).
    #[serde(default = "default_max_outcome_entries")]
    pub max_outcome_entries: usize,
}

fn default_max_concurrent_partitions() -> usize {
    4
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    250
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_max_outcome_entries() -> usize {
    1000
}

impl JobSettings {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_concurrent_partitions: default_max_concurrent_partitions(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_outcome_entries: default_max_outcome_entries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageSettings {
    #[serde(default)]
    pub file: FileStorageSettings,
    #[serde(default)]
    pub https: HttpsStorageSettings,
    #[serde(default)]
    pub s3: Option<S3StorageSettings>,
    #[serde(default)]
    pub azure: Option<AzureStorageSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStorageSettings {
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    /// Nest every location under `<base_dir>/<tenant>`.
    #[serde(default)]
    pub tenant_isolation: bool,
}

fn default_base_dir() -> String {
    "./bulkdata".into()
}

impl Default for FileStorageSettings {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            tenant_isolation: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpsStorageSettings {
    #[serde(default = "default_https_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_https_timeout_ms() -> u64 {
    30_000
}
fn default_user_agent() -> String {
    concat!("octofhir-bulk/", env!("CARGO_PKG_VERSION")).into()
}

impl Default for HttpsStorageSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_https_timeout_ms(),
            user_agent: default_user_agent(),
        }
    }
}

/// S3-compatible object storage (AWS, MinIO, IBM COS).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3StorageSettings {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    pub bucket: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub path_style: bool,
}

fn default_region() -> String {
    "us-east-1".into()
}

/// Azure Blob Storage authenticated with a SAS token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureStorageSettings {
    #[serde(default)]
    pub account: String,
    pub container: String,
    /// SAS token without the leading `?`.
    #[serde(default)]
    pub sas_token: Option<String>,
    /// Overrides `https://{account}.blob.core.windows.net` (e.g. Azurite).
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl AzureStorageSettings {
    pub fn service_url(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", self.account))
            .trim_end_matches('/')
            .to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::BulkDataConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_FILE: &str = "octofhir-bulk.toml";

    pub fn load_config(path: Option<&str>) -> Result<BulkDataConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., OCTOFHIR_BULK__EXPORT__PAGE_SIZE=500
        builder = builder.add_source(
            Environment::with_prefix("OCTOFHIR_BULK")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: BulkDataConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
