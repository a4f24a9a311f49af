use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Buffer accounting policy for the event log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchMode {
    /// quota counted in entries
    #[default]
    ItemSize,
    /// quota counted in accumulated payload bytes
    MemSize,
}

impl BatchMode {
    pub fn is_mem_size(&self) -> bool {
        matches!(self, BatchMode::MemSize)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Ring capacity, must be a power of two.
    pub buffer_size: usize,
    /// Bytes per slot when the quota is memory based; the memory ceiling is
    /// `buffer_size * buffer_mem_unit`.
    pub buffer_mem_unit: usize,
    pub batch_mode: BatchMode,
    /// Deliver schema-change events in a batch of their own.
    pub ddl_isolation: bool,
    /// Restrict ack boundaries to whole transactions when resuming by gtid.
    pub gtid_mode: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            buffer_size: 16 * 1024,
            buffer_mem_unit: 1024,
            batch_mode: BatchMode::ItemSize,
            ddl_isolation: false,
            gtid_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblerConfig {
    /// Transaction staging ring capacity, must be a power of two.
    pub buffer_size: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self { buffer_size: 1024 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    /// Base directory for per-destination cursor files.
    pub data_dir: String,
    /// Interval of the background cursor flush task, millis.
    pub flush_interval_ms: u64,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            data_dir: "meta".to_string(),
            flush_interval_ms: 1000,
        }
    }
}

/// Whole-pipeline configuration. Passed explicitly into constructors; there
/// is deliberately no process-global config cell.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub store: StoreConfig,
    pub assembler: AssemblerConfig,
    pub meta: MetaConfig,
}

impl PipelineConfig {
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<PipelineConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;
        let pipeline_config: PipelineConfig = config.try_deserialize()?;
        pipeline_config.validate()?;
        Ok(pipeline_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if !self.store.buffer_size.is_power_of_two() {
            return Err(AppError::InvalidValue(format!(
                "store.buffer_size must be a power of two, got {}",
                self.store.buffer_size
            )));
        }
        if !self.assembler.buffer_size.is_power_of_two() {
            return Err(AppError::InvalidValue(format!(
                "assembler.buffer_size must be a power of two, got {}",
                self.assembler.buffer_size
            )));
        }
        Ok(())
    }
}
