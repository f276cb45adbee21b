use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:5173,https://dobbe-ai.vercel.app";
const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Clone)]
pub struct AppConfig {
    pub detection_url: Url,
    pub detection_api_key: String,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub gemini_api_base: String,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub upstream_timeout: Duration,
    pub allowed_origins: Vec<String>,
    pub port: u16,
}

// Keys stay out of logs.
impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("detection_url", &self.detection_url.as_str())
            .field("detection_api_key", &"<redacted>")
            .field("gemini_api_key", &"<redacted>")
            .field("gemini_model", &self.gemini_model)
            .field("gemini_api_base", &self.gemini_api_base)
            .field("upload_dir", &self.upload_dir)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("upstream_timeout", &self.upstream_timeout)
            .field("allowed_origins", &self.allowed_origins)
            .field("port", &self.port)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let detection_url = Url::parse(&required("ROBOFLOW_API_URL")?).map_err(|e| {
            ConfigError::Invalid {
                name: "ROBOFLOW_API_URL",
                reason: e.to_string(),
            }
        })?;

        let allowed_origins = get("ALLOWED_ORIGINS")
            .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGINS.to_string())
            .split(',')
            .map(|origin| origin.trim().trim_end_matches('/').to_string())
            .filter(|origin| !origin.is_empty())
            .map(validate_origin)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            detection_url,
            detection_api_key: required("ROBOFLOW_API_KEY")?,
            gemini_api_key: required("GEMINI_API_KEY")?,
            gemini_model: get("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            gemini_api_base: get("GEMINI_API_BASE")
                .unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string()),
            upload_dir: get("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR)),
            max_upload_bytes: parse_or("MAX_UPLOAD_BYTES", get("MAX_UPLOAD_BYTES"), DEFAULT_MAX_UPLOAD_BYTES)?,
            upstream_timeout: Duration::from_secs(parse_or(
                "UPSTREAM_TIMEOUT_SECS",
                get("UPSTREAM_TIMEOUT_SECS"),
                DEFAULT_UPSTREAM_TIMEOUT_SECS,
            )?),
            allowed_origins,
            port: parse_or("PORT", get("PORT"), DEFAULT_PORT)?,
        })
    }
}

fn parse_or<T>(name: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match value {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: format!("{:?}: {}", raw, e),
        }),
        None => Ok(default),
    }
}

fn validate_origin(origin: String) -> Result<String, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        name: "ALLOWED_ORIGINS",
        reason,
    };
    let url = Url::parse(&origin).map_err(|e| invalid(format!("{:?}: {}", origin, e)))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(invalid(format!("{:?} is not an http(s) origin", origin)));
    }
    Ok(origin)
}
