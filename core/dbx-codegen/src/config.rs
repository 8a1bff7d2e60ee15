//! Code generation configuration
//!
//! Per-query knobs for the generator: which paradigm to emit, how filters mark
//! rows in a batch, the output batch capacity and the SIMD lane setup. Values
//! come from code, JSON, or `DBX_CODEGEN_*` environment overrides.

use crate::error::{DbxError, DbxResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

/// Default number of rows in a column batch / output batch.
pub const DEFAULT_VECTOR_CAPACITY: usize = 1024;

/// Which code-generation paradigm to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Paradigm {
    /// Vectorised when every operator supports it, row-at-a-time otherwise
    Auto,
    NonVectorised,
    Vectorised,
}

impl Paradigm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Paradigm::Auto => "auto",
            Paradigm::NonVectorised => "non_vectorised",
            Paradigm::Vectorised => "vectorised",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(Paradigm::Auto),
            "non_vectorised" | "non-vectorised" | "row" => Some(Paradigm::NonVectorised),
            "vectorised" | "vectorized" | "batch" => Some(Paradigm::Vectorised),
            _ => None,
        }
    }
}

/// How a vectorised filter marks surviving rows. Fixed per configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterPolicy {
    /// Compact surviving row indices into a selection vector
    SelectionVector,
    /// Keep a boolean validity array parallel to the batch
    ValidityMask,
}

impl FilterPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterPolicy::SelectionVector => "selection_vector",
            FilterPolicy::ValidityMask => "validity_mask",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "selection_vector" | "selection" => Some(FilterPolicy::SelectionVector),
            "validity_mask" | "validity" => Some(FilterPolicy::ValidityMask),
            _ => None,
        }
    }
}

/// Hardware vector width used for SIMD lane groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LaneWidth {
    X4,
    X8,
    X16,
}

impl LaneWidth {
    pub fn lanes(&self) -> usize {
        match self {
            LaneWidth::X4 => 4,
            LaneWidth::X8 => 8,
            LaneWidth::X16 => 16,
        }
    }

    pub fn from_lanes(lanes: usize) -> Option<Self> {
        match lanes {
            4 => Some(LaneWidth::X4),
            8 => Some(LaneWidth::X8),
            16 => Some(LaneWidth::X16),
            _ => None,
        }
    }
}

impl fmt::Display for LaneWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.lanes())
    }
}

/// SIMD lane configuration for vectorised filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimdConfig {
    pub enabled: bool,
    pub lane_width: LaneWidth,
}

impl Default for SimdConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lane_width: LaneWidth::X8,
        }
    }
}

/// 코드 생성 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodegenConfig {
    /// Name given to the emitted procedure
    pub procedure_name: String,
    pub paradigm: Paradigm,
    pub filter_policy: FilterPolicy,
    /// Rows per input batch and per emitted output batch
    pub vector_capacity: usize,
    pub simd: SimdConfig,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        Self {
            procedure_name: "compiled_query".to_string(),
            paradigm: Paradigm::Auto,
            filter_policy: FilterPolicy::SelectionVector,
            vector_capacity: DEFAULT_VECTOR_CAPACITY,
            simd: SimdConfig::default(),
        }
    }
}

impl CodegenConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_paradigm(mut self, paradigm: Paradigm) -> Self {
        self.paradigm = paradigm;
        self
    }

    pub fn with_filter_policy(mut self, policy: FilterPolicy) -> Self {
        self.filter_policy = policy;
        self
    }

    pub fn with_vector_capacity(mut self, capacity: usize) -> Self {
        self.vector_capacity = capacity;
        self
    }

    pub fn with_simd(mut self, lane_width: LaneWidth) -> Self {
        self.simd = SimdConfig {
            enabled: true,
            lane_width,
        };
        self
    }

    pub fn with_procedure_name(mut self, name: impl Into<String>) -> Self {
        self.procedure_name = name.into();
        self
    }

    /// Check value ranges.
    pub fn validate(&self) -> DbxResult<()> {
        if self.vector_capacity == 0 {
            return Err(DbxError::Config(
                "vector_capacity must be greater than zero".to_string(),
            ));
        }
        if self.vector_capacity > i32::MAX as usize {
            return Err(DbxError::Config(format!(
                "vector_capacity {} exceeds the i32 index range",
                self.vector_capacity
            )));
        }
        let valid_name = self
            .procedure_name
            .chars()
            .enumerate()
            .all(|(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()));
        if self.procedure_name.is_empty() || !valid_name {
            return Err(DbxError::Config(format!(
                "procedure_name '{}' is not a valid identifier",
                self.procedure_name
            )));
        }
        Ok(())
    }

    /// 환경 변수에서 로드
    pub fn from_env() -> DbxResult<Self> {
        Self::default().overlay_env(|key| env::var(key).ok())
    }

    /// Apply `DBX_CODEGEN_*` overrides read through `lookup`.
    pub fn overlay_env<F>(mut self, lookup: F) -> DbxResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("DBX_CODEGEN_PARADIGM") {
            self.paradigm = Paradigm::parse(&value)
                .ok_or_else(|| DbxError::Config(format!("unknown paradigm '{value}'")))?;
        }
        if let Some(value) = lookup("DBX_CODEGEN_FILTER_POLICY") {
            self.filter_policy = FilterPolicy::parse(&value)
                .ok_or_else(|| DbxError::Config(format!("unknown filter policy '{value}'")))?;
        }
        if let Some(value) = lookup("DBX_CODEGEN_VECTOR_CAPACITY") {
            self.vector_capacity = value.trim().parse().map_err(|_| {
                DbxError::Config(format!("vector capacity '{value}' is not a number"))
            })?;
        }
        if let Some(value) = lookup("DBX_CODEGEN_SIMD") {
            self.simd.enabled = value.to_lowercase() == "true" || value == "1";
        }
        if let Some(value) = lookup("DBX_CODEGEN_LANE_WIDTH") {
            self.simd.lane_width = value
                .trim()
                .parse::<usize>()
                .ok()
                .and_then(LaneWidth::from_lanes)
                .ok_or_else(|| DbxError::Config(format!("unsupported lane width '{value}'")))?;
        }
        self.validate()?;
        Ok(self)
    }

    /// 파일에서 로드
    pub fn load_from_file(path: &Path) -> DbxResult<Self> {
        let json = fs::read_to_string(path)?;
        let config: CodegenConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> DbxResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
