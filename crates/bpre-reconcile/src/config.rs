//! Runtime configuration: defaults, optional YAML file, then environment.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use bpre_storage::ApiClientConfig;
use serde::Deserialize;

use crate::executor::DEFAULT_CONCURRENCY;
use crate::roster::{DEFAULT_MAX_PAGES, DEFAULT_PAGE_SIZE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub page_size: usize,
    pub max_pages: usize,
    pub concurrency: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    /// `None` disables report files.
    pub reports_dir: Option<PathBuf>,
    pub bind_addr: String,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000/api".to_string(),
            api_token: None,
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
            concurrency: DEFAULT_CONCURRENCY,
            http_timeout_secs: 20,
            user_agent: "bpre/0.1".to_string(),
            reports_dir: Some(PathBuf::from("./reports")),
            bind_addr: "127.0.0.1:8088".to_string(),
        }
    }
}

/// Shape of the optional file named by `BPRE_CONFIG`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub api_base_url: Option<String>,
    pub api_token: Option<String>,
    pub page_size: Option<usize>,
    pub max_pages: Option<usize>,
    pub concurrency: Option<usize>,
    pub http_timeout_secs: Option<u64>,
    pub user_agent: Option<String>,
    pub reports_dir: Option<String>,
    pub bind_addr: Option<String>,
}

impl ReconcileConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("BPRE_CONFIG").filter(|p| !p.trim().is_empty()) {
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            let file: ConfigFile =
                serde_yaml::from_str(&text).with_context(|| format!("parsing {path}"))?;
            config.apply_file(file);
        }

        if let Some(v) = lookup("BPRE_API_BASE_URL") {
            config.api_base_url = v;
        }
        if let Some(v) = lookup("BPRE_API_TOKEN") {
            config.api_token = Some(v).filter(|t| !t.trim().is_empty());
        }
        if let Some(v) = lookup("BPRE_PAGE_SIZE") {
            config.page_size = parse_number("BPRE_PAGE_SIZE", &v)?;
        }
        if let Some(v) = lookup("BPRE_MAX_PAGES") {
            config.max_pages = parse_number("BPRE_MAX_PAGES", &v)?;
        }
        if let Some(v) = lookup("BPRE_CONCURRENCY") {
            config.concurrency = parse_number("BPRE_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("BPRE_HTTP_TIMEOUT_SECS") {
            config.http_timeout_secs = parse_number("BPRE_HTTP_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("BPRE_USER_AGENT") {
            config.user_agent = v;
        }
        if let Some(v) = lookup("BPRE_REPORTS_DIR") {
            config.reports_dir = reports_dir_from(&v);
        }
        if let Some(v) = lookup("BPRE_BIND_ADDR") {
            config.bind_addr = v;
        }

        config.page_size = config.page_size.max(1);
        config.max_pages = config.max_pages.max(1);
        config.concurrency = config.concurrency.max(1);
        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.api_base_url {
            self.api_base_url = v;
        }
        if file.api_token.is_some() {
            self.api_token = file.api_token;
        }
        if let Some(v) = file.page_size {
            self.page_size = v;
        }
        if let Some(v) = file.max_pages {
            self.max_pages = v;
        }
        if let Some(v) = file.concurrency {
            self.concurrency = v;
        }
        if let Some(v) = file.http_timeout_secs {
            self.http_timeout_secs = v;
        }
        if let Some(v) = file.user_agent {
            self.user_agent = v;
        }
        if let Some(v) = file.reports_dir {
            self.reports_dir = reports_dir_from(&v);
        }
        if let Some(v) = file.bind_addr {
            self.bind_addr = v;
        }
    }

    pub fn api_client_config(&self) -> ApiClientConfig {
        ApiClientConfig {
            base_url: self.api_base_url.clone(),
            bearer_token: self.api_token.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.concurrency,
            ..Default::default()
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a number, got `{value}`"))
}

fn reports_dir_from(value: &str) -> Option<PathBuf> {
    match value.trim() {
        "" | "off" | "none" => None,
        other => Some(PathBuf::from(other)),
    }
}
