use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ContractError, Result};
use crate::stamp::PageMode;

/// Runtime configuration for the contract pipeline.
///
/// Loaded from a TOML file, with secrets (token secret, certificate password)
/// preferring the environment so they stay out of checked-in config. A `.env`
/// file is honored via `dotenv`.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// PKCS#12 container holding the officer's key and certificate chain.
    pub certificate_path: PathBuf,
    #[serde(default)]
    pub certificate_password: String,
    #[serde(default)]
    pub token_secret: String,
    #[serde(default = "default_ttl")]
    pub token_ttl_minutes: i64,
    pub officer_name: String,
    /// Base URL used to build absolute signing links.
    pub public_base_url: String,
    /// Directory for contract records, document revisions, signature assets
    /// and the audit log.
    pub data_dir: PathBuf,
    #[serde(default)]
    pub page_mode: PageMode,
    #[serde(default = "default_digest")]
    pub digest_algorithm: String,
}

fn default_ttl() -> i64 {
    60
}

fn default_digest() -> String {
    "sha256".to_string()
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        dotenv::dotenv().ok();
        let raw = fs::read_to_string(path).map_err(|e| {
            ContractError::RenderingFailed(format!("cannot read config {}: {e}", path.display()))
        })?;
        let mut settings: Settings = toml::from_str(&raw)
            .map_err(|e| ContractError::RenderingFailed(format!("cannot parse config: {e}")))?;
        settings.apply_env();
        Ok(settings)
    }

    /// Environment overrides. Secrets always win from the environment when set.
    pub fn apply_env(&mut self) {
        if let Ok(v) = env::var("SIGN_TOKEN_SECRET") {
            self.token_secret = v;
        }
        if let Ok(v) = env::var("CONTRACT_CERT_PASSWORD") {
            self.certificate_password = v;
        }
        if let Ok(v) = env::var("CONTRACT_CERT_PATH") {
            self.certificate_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("SIGN_LINK_EXP_MINUTES") {
            if let Ok(minutes) = v.parse() {
                self.token_ttl_minutes = minutes;
            }
        }
    }
}
