/// Configuration for the Hydstra extraction pipeline.
///
/// Loaded from a TOML file, with credentials and the database URL taken from
/// the environment (and `.env`, via dotenv) when present. Each component gets
/// its own section and receives that section at construction time.
///
/// ```toml
/// [hydllp]
/// ini_path = '\\fileservices02\ManagedShares\Data\Hydstra\prod\hyd'
/// dll_path = '\\fileservices02\ManagedShares\Data\Hydstra\prod\hyd\sys\run'
///
/// [metadata]
/// database_url = "postgres://hydstra@localhost/hydstra"
///
/// [extract]
/// data_source = "A"
/// interval = "day"
/// qual_codes = [30, 20, 10, 11, 21, 18]
/// ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::model::{HydstraError, QualityCode, VariableCode};
use crate::rpc::protocol::Interval;
use crate::variables::{default_exclusions, Exclusion, UNUSED_VARIABLE};

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub hydllp: HydllpConfig,
    #[serde(default)]
    pub webservice: Option<WebServiceConfig>,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
}

/// Where the native library and its ini files live, and how to log in.
#[derive(Debug, Clone, Deserialize)]
pub struct HydllpConfig {
    pub ini_path: PathBuf,
    pub dll_path: PathBuf,
    #[serde(default = "default_hydllp_filename")]
    pub hydllp_filename: String,
    #[serde(default = "default_hyaccess_filename")]
    pub hyaccess_filename: String,
    #[serde(default = "default_hyconfig_filename")]
    pub hyconfig_filename: String,
    /// Blank lets Hydstra use the OS user.
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// First response buffer size; the server asks for more if needed.
    #[serde(default = "default_buffer_len")]
    pub initial_buffer_len: usize,
}

impl HydllpConfig {
    pub fn library_path(&self) -> PathBuf {
        self.dll_path.join(&self.hydllp_filename)
    }

    pub fn hyaccess_path(&self) -> PathBuf {
        self.ini_path.join(&self.hyaccess_filename)
    }

    pub fn hyconfig_path(&self) -> PathBuf {
        self.ini_path.join(&self.hyconfig_filename)
    }
}

/// The Hydstra web service endpoint, for hosts without the native library.
#[derive(Debug, Clone, Deserialize)]
pub struct WebServiceConfig {
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataConfig {
    #[serde(default)]
    pub database_url: String,
}

/// Defaults for trace extraction.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractConfig {
    #[serde(default = "default_data_source")]
    pub data_source: String,
    #[serde(default)]
    pub interval: Interval,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default = "default_qual_codes")]
    pub qual_codes: Vec<QualityCode>,
    /// Sites per `get_ts_traces` call. Larger chunks overflow the
    /// transport's payload limit.
    #[serde(default = "default_sites_chunk")]
    pub sites_chunk: usize,
    #[serde(default)]
    pub report_time: Option<String>,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            data_source: default_data_source(),
            interval: Interval::default(),
            multiplier: default_multiplier(),
            qual_codes: default_qual_codes(),
            sites_chunk: default_sites_chunk(),
            report_time: None,
        }
    }
}

/// Site-specific period corrections applied by the resolver.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_exclusions")]
    pub exclusions: Vec<Exclusion>,
    #[serde(default = "default_unused_variable")]
    pub unused_variable: VariableCode,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            exclusions: default_exclusions(),
            unused_variable: UNUSED_VARIABLE,
        }
    }
}

fn default_hydllp_filename() -> String {
    "hydllp.dll".to_string()
}

fn default_hyaccess_filename() -> String {
    "Hyaccess.ini".to_string()
}

fn default_hyconfig_filename() -> String {
    "HYCONFIG.INI".to_string()
}

fn default_buffer_len() -> usize {
    1400
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_data_source() -> String {
    "A".to_string()
}

fn default_multiplier() -> u32 {
    1
}

fn default_qual_codes() -> Vec<QualityCode> {
    vec![30, 20, 10, 11, 21, 18]
}

fn default_sites_chunk() -> usize {
    20
}

fn default_unused_variable() -> VariableCode {
    UNUSED_VARIABLE
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Parses configuration from TOML text without consulting the environment.
    pub fn from_toml_str(text: &str) -> Result<Config, HydstraError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from `path`, then applies environment overrides:
    /// `DATABASE_URL`, `HYDSTRA_USERNAME`, `HYDSTRA_PASSWORD`.
    pub fn load(path: &Path) -> Result<Config, HydstraError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HydstraError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Config::from_toml_str(&text)?;

        dotenv::dotenv().ok();
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL") {
            self.metadata.database_url = url;
        }
        if let Some(user) = lookup("HYDSTRA_USERNAME") {
            self.hydllp.username = user;
        }
        if let Some(password) = lookup("HYDSTRA_PASSWORD") {
            self.hydllp.password = password;
        }
    }

    fn validate(&self) -> Result<(), HydstraError> {
        if self.extract.sites_chunk == 0 {
            return Err(HydstraError::Config("extract.sites_chunk must be at least 1".into()));
        }
        if self.extract.multiplier == 0 {
            return Err(HydstraError::Config("extract.multiplier must be at least 1".into()));
        }
        if self.hydllp.initial_buffer_len == 0 {
            return Err(HydstraError::Config(
                "hydllp.initial_buffer_len must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
