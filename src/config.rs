use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::warn;

static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Annual trading sessions used for annualization.
pub const TRADING_DAYS: f64 = 252.0;
/// Lookback used when the caller does not name one.
pub const DEFAULT_PERIOD: &str = "6mo";

/// Decimal places for returns, volatility and prices.
pub const VALUE_PRECISION: i32 = 6;
/// Decimal places for the Sharpe ratio.
pub const SHARPE_PRECISION: i32 = 4;

/// Upper bound on one-call-per-instrument re-fetches in the last fallback.
pub const MAX_INDIVIDUAL_REFETCH: usize = 25;
/// Rolling window (in returns) for the predictor's volatility feature.
pub const VOLATILITY_WINDOW: usize = 5;

pub const DEFAULT_YAHOO_BASE_URL: &str = "https://query1.finance.yahoo.com";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_API_VERSION: &str = "v1";
pub const MODEL_ARTIFACT_PATH: &str = "ml/models/volatility_model.json";

/// Frontend origins allowed by the HTTP shell's CORS layer.
pub const ALLOWED_ORIGINS: &[&str] = &[
    "http://localhost",
    "http://localhost:5173",
    "http://127.0.0.1:5173",
    "http://127.0.0.1:8000",
];

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub model_path: PathBuf,
    pub yahoo_base_url: String,
    pub port: u16,
    pub api_version: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_path: project_file_path(MODEL_ARTIFACT_PATH),
            yahoo_base_url: DEFAULT_YAHOO_BASE_URL.to_string(),
            port: DEFAULT_PORT,
            api_version: DEFAULT_API_VERSION.to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from any key lookup; blank values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut settings = Self::default();

        if let Some(path) = read("FINSIGHT_MODEL_PATH") {
            settings.model_path = PathBuf::from(path);
        }
        if let Some(base) = read("FINSIGHT_YAHOO_BASE") {
            settings.yahoo_base_url = base.trim_end_matches('/').to_string();
        }
        if let Some(port) = read("FINSIGHT_PORT") {
            match port.parse::<u16>() {
                Ok(p) => settings.port = p,
                Err(_) => warn!(
                    "Invalid FINSIGHT_PORT={} ; defaulting to {}",
                    port, DEFAULT_PORT
                ),
            }
        }
        if let Some(version) = read("FINSIGHT_API_VERSION") {
            settings.api_version = version;
        }

        settings
    }
}

/// Process-wide settings, read from the environment on first use.
pub fn settings() -> &'static Settings {
    SETTINGS.get_or_init(Settings::from_env)
}

pub fn project_root_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

pub fn project_file_path(file_name: &str) -> PathBuf {
    project_root_path().join(file_name)
}
