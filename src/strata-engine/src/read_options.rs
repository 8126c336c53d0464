//! User-facing read options.

use serde::{Deserialize, Serialize};

/// Shape of the final user result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputFormat {
    #[default]
    Pandas,
    Arrow,
    Native,
}

/// Named knobs consumed by the pipeline driver and the embedding API.
///
/// Booleans are tri-state: unset falls back to `false`, so a caller can
/// distinguish "defaulted" from "explicitly disabled".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadOptions {
    pub force_strings_to_fixed: Option<bool>,
    pub force_strings_to_object: Option<bool>,
    pub incompletes: Option<bool>,
    pub dynamic_schema: Option<bool>,
    pub allow_sparse: Option<bool>,
    pub set_tz: Option<bool>,
    pub optimise_string_memory: Option<bool>,
    pub batch_throw_on_error: Option<bool>,
    pub output_format: OutputFormat,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dynamic_schema(mut self, dynamic_schema: bool) -> Self {
        self.dynamic_schema = Some(dynamic_schema);
        self
    }

    pub fn with_incompletes(mut self, incompletes: bool) -> Self {
        self.incompletes = Some(incompletes);
        self
    }

    pub fn with_output_format(mut self, output_format: OutputFormat) -> Self {
        self.output_format = output_format;
        self
    }

    pub fn dynamic_schema(&self) -> bool {
        self.dynamic_schema.unwrap_or(false)
    }

    pub fn incompletes(&self) -> bool {
        self.incompletes.unwrap_or(false)
    }

    pub fn batch_throw_on_error(&self) -> bool {
        self.batch_throw_on_error.unwrap_or(false)
    }
}
