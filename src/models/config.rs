//! Configuration models for histmatch.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns at runtime via config file.
//!
//! Loading only checks TOML syntax. Values whose validity depends on the model
//! (parameter names, cut lengths, sample counts) are checked at the earliest
//! point they are needed, see [`EmulatorConfig::validate_static`] and the
//! pipeline constructors.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::{HistMatchError, Result};

/// Top-level configuration for histmatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Emulator construction settings
    #[serde(default)]
    pub emulator: EmulatorConfig,

    /// Projection settings
    #[serde(default)]
    pub projection: ProjectionConfig,

    /// Store settings
    #[serde(default)]
    pub store: StoreConfig,
}

/// Emulator construction parameters.
///
/// Epistemic foundation:
/// - I^R: Every sampling, fitting and cut parameter is resolved here
/// - B_i: `method`, `criterion` and `pot_active_par` are kept raw and parsed
///   when first needed, so bad values surface as typed errors at that point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorConfig {
    /// Number of initial Latin-hypercube samples for iteration 1
    #[serde(default = "default_n_sam_init")]
    pub n_sam_init: usize,

    /// Number of samples drawn from the plausible region for later iterations
    #[serde(default)]
    pub n_sam_refine: Option<usize>,

    /// Candidate population per parameter used for implausibility analysis
    #[serde(default = "default_base_eval_sam")]
    pub base_eval_sam: usize,

    /// Gaussian amplitude used when no regression residual variance exists
    #[serde(default = "default_sigma")]
    pub sigma: f64,

    /// Correlation length as a fraction of each parameter range
    #[serde(default = "default_l_corr")]
    pub l_corr: f64,

    /// Implausibility cut-off per rank (0.0 = wildcard)
    #[serde(default = "default_impl_cut")]
    pub impl_cut: Vec<f64>,

    /// Space-filling criterion for Latin-hypercube designs
    #[serde(default)]
    pub criterion: Option<CriterionSetting>,

    /// Emulation method: "regression", "gaussian" or "full"
    #[serde(default = "default_method")]
    pub method: String,

    /// Include regression coefficient covariance in the Gaussian prior
    #[serde(default)]
    pub use_regr_cov: bool,

    /// Highest polynomial order considered by regression and active-parameter tests
    #[serde(default = "default_poly_order")]
    pub poly_order: u32,

    /// Number of cross-validation folds used to pick the regression order
    #[serde(default = "default_n_cross_val")]
    pub n_cross_val: usize,

    /// Run the active-parameter analysis (otherwise every eligible parameter is active)
    #[serde(default = "default_true")]
    pub do_active_anal: bool,

    /// Keep parameters active once they were active in an earlier iteration
    #[serde(default = "default_true")]
    pub freeze_active_par: bool,

    /// Parameters eligible to become active (names or indices); all when absent
    #[serde(default)]
    pub pot_active_par: Option<PotActiveSetting>,

    /// Significance level of the active-parameter F-test
    #[serde(default = "default_active_par_alpha")]
    pub active_par_alpha: f64,

    /// Use mock data instead of the model's observational data
    #[serde(default)]
    pub use_mock: MockSetting,

    /// Seed for every random draw made by the pipeline
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Bounded number of extra candidate rounds when refining samples
    #[serde(default = "default_max_refine_rounds")]
    pub max_refine_rounds: usize,

    /// Show a progress bar while evaluating candidate populations
    #[serde(default)]
    pub progress: bool,
}

fn default_n_sam_init() -> usize {
    500
}

fn default_base_eval_sam() -> usize {
    800
}

fn default_sigma() -> f64 {
    0.8
}

fn default_l_corr() -> f64 {
    0.3
}

fn default_impl_cut() -> Vec<f64> {
    vec![0.0, 4.0, 3.8, 3.5]
}

fn default_method() -> String {
    "full".to_string()
}

fn default_poly_order() -> u32 {
    3
}

fn default_n_cross_val() -> usize {
    5
}

fn default_active_par_alpha() -> f64 {
    0.05
}

fn default_seed() -> u64 {
    4
}

fn default_max_refine_rounds() -> usize {
    3
}

fn default_true() -> bool {
    true
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            n_sam_init: default_n_sam_init(),
            n_sam_refine: None,
            base_eval_sam: default_base_eval_sam(),
            sigma: default_sigma(),
            l_corr: default_l_corr(),
            impl_cut: default_impl_cut(),
            criterion: None,
            method: default_method(),
            use_regr_cov: false,
            poly_order: default_poly_order(),
            n_cross_val: default_n_cross_val(),
            do_active_anal: true,
            freeze_active_par: true,
            pot_active_par: None,
            active_par_alpha: default_active_par_alpha(),
            use_mock: MockSetting::default(),
            seed: default_seed(),
            max_refine_rounds: default_max_refine_rounds(),
            progress: false,
        }
    }
}

impl EmulatorConfig {
    /// Samples drawn for every iteration after the first.
    pub fn n_sam_refine(&self) -> usize {
        self.n_sam_refine.unwrap_or(self.n_sam_init)
    }

    /// Size of the candidate population for a model with `n_par` parameters.
    pub fn n_eval_sam(&self, n_par: usize) -> usize {
        self.base_eval_sam * n_par.max(1)
    }

    /// Validate the values that do not depend on the model.
    ///
    /// B_i(sample counts positive, scalars finite) → Result
    pub fn validate_static(&self) -> std::result::Result<(), ConfigError> {
        if self.n_sam_init == 0 {
            return Err(ConfigError::NonPositive("n_sam_init"));
        }
        if self.n_sam_refine == Some(0) {
            return Err(ConfigError::NonPositive("n_sam_refine"));
        }
        if self.base_eval_sam == 0 {
            return Err(ConfigError::NonPositive("base_eval_sam"));
        }
        if !(self.sigma.is_finite() && self.sigma > 0.0) {
            return Err(ConfigError::InvalidScalar {
                name: "sigma",
                value: self.sigma,
            });
        }
        if !(self.l_corr.is_finite() && self.l_corr > 0.0) {
            return Err(ConfigError::InvalidScalar {
                name: "l_corr",
                value: self.l_corr,
            });
        }
        if !(self.active_par_alpha > 0.0 && self.active_par_alpha < 1.0) {
            return Err(ConfigError::InvalidScalar {
                name: "active_par_alpha",
                value: self.active_par_alpha,
            });
        }
        Ok(())
    }
}

/// Raw `criterion` setting as written in the config file.
///
/// K_i: TOML gives us a string, a float or a bool; only the first two are meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CriterionSetting {
    Flag(bool),
    Weight(f64),
    Name(String),
}

/// Raw `pot_active_par` setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PotActiveSetting {
    Flag(bool),
    List(Vec<ParRef>),
}

/// Reference to a model parameter by position or by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParRef {
    Index(usize),
    Name(String),
}

impl From<usize> for ParRef {
    fn from(i: usize) -> Self {
        Self::Index(i)
    }
}

impl From<&str> for ParRef {
    fn from(s: &str) -> Self {
        Self::Name(s.to_string())
    }
}

impl std::fmt::Display for ParRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::Name(n) => write!(f, "{n:?}"),
        }
    }
}

/// Raw `use_mock` setting: off, on (estimates), or explicit parameter values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MockSetting {
    Flag(bool),
    Values(Vec<f64>),
}

impl Default for MockSetting {
    fn default() -> Self {
        Self::Flag(false)
    }
}

impl MockSetting {
    pub fn enabled(&self) -> bool {
        !matches!(self, Self::Flag(false))
    }
}

/// Projection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionConfig {
    /// Grid points per projected axis
    #[serde(default = "default_proj_res")]
    pub proj_res: usize,

    /// Hidden-parameter samples per grid point
    #[serde(default = "default_proj_depth")]
    pub proj_depth: usize,

    /// "2D", "3D" or "both"
    #[serde(default = "default_proj_type")]
    pub proj_type: String,
}

fn default_proj_res() -> usize {
    25
}

fn default_proj_depth() -> usize {
    250
}

fn default_proj_type() -> String {
    "both".to_string()
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            proj_res: default_proj_res(),
            proj_depth: default_proj_depth(),
            proj_type: default_proj_type(),
        }
    }
}

/// Store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the iteration store
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("histmatch_0")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            working_dir: default_working_dir(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &std::path::Path) -> std::result::Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::ParseStr(source) => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> std::result::Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::ParseStr)
    }

    /// Check everything that can be checked without a model.
    pub fn validate(&self) -> Result<()> {
        self.emulator.validate_static()?;
        if self.projection.proj_res < 2 {
            return Err(HistMatchError::Value(format!(
                "proj_res must be at least 2, got {}",
                self.projection.proj_res
            )));
        }
        if self.projection.proj_depth == 0 {
            return Err(ConfigError::NonPositive("proj_depth").into());
        }
        Ok(())
    }
}

/// Configuration errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error, invalid static values
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to parse config: {0}")]
    ParseStr(toml::de::Error),

    #[error("Parameter '{name}' has invalid bounds [{lower}, {upper}]")]
    InvalidBounds { name: String, lower: f64, upper: f64 },

    #[error("'{0}' must be a positive count")]
    NonPositive(&'static str),

    #[error("'{name}' has invalid value {value}")]
    InvalidScalar { name: &'static str, value: f64 },

    #[error("impl_cut must contain at least one value")]
    EmptyImplCut,

    #[error("n_cross_val must be at least 2, got {0}")]
    TooFewFolds(usize),

    #[error("n_cross_val ({n_cross_val}) exceeds the number of available samples ({n_sam})")]
    FoldsExceedSamples { n_cross_val: usize, n_sam: usize },
}
