//! Application configuration. API credentials, workload, pipeline tunables.
//!
//! Loaded from environment (prefix `TG_MIRROR`) plus an optional file named
//! by `TG_MIRROR_CONFIG`. Validation failures are fatal before any work
//! starts.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProxyConfig {
    /// socks5 | socks4 | http | https
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Proxy URL for the transport layer, credentials included when present.
    pub fn url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                format!("{}://{}:{}@{}:{}", self.scheme, user, pass, self.host, self.port)
            }
            (Some(user), None) => {
                format!("{}://{}@{}:{}", self.scheme, user, self.host, self.port)
            }
            _ => format!("{}://{}:{}", self.scheme, self.host, self.port),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TemplateSettings {
    /// "original" or "custom".
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Path to a full template definition document (JSON); overrides
    /// `mode`/`body` when present.
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RetrySettings {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub base_delay_secs: Option<u64>,
    #[serde(default)]
    pub max_delay_secs: Option<u64>,
    #[serde(default)]
    pub factor: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MirrorConfig {
    /// Pool members; one credential file per name under `session_dir`.
    #[serde(default)]
    pub session_names: Vec<String>,
    pub api_id: Option<i32>,
    pub api_hash: Option<String>,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,

    /// Input surface.
    pub source_channel: Option<String>,
    pub start_id: Option<i32>,
    pub end_id: Option<i32>,

    /// Publish destinations; empty means download-only.
    #[serde(default)]
    pub target_channels: Vec<String>,

    pub session_dir: Option<String>,
    pub download_dir: Option<String>,

    #[serde(default)]
    pub fetch_batch_size: Option<usize>,
    #[serde(default)]
    pub download_threshold_mb: Option<f64>,
    #[serde(default)]
    pub concurrent_downloads: Option<usize>,
    #[serde(default)]
    pub stage_batch_size: Option<usize>,
    #[serde(default)]
    pub upload_queue_size: Option<usize>,
    #[serde(default)]
    pub upload_consumers: Option<usize>,
    #[serde(default)]
    pub fanout_concurrency: Option<usize>,
    #[serde(default)]
    pub cleanup_after_success: Option<bool>,
    #[serde(default)]
    pub cleanup_after_failure: Option<bool>,
    #[serde(default)]
    pub preserve_structure: Option<bool>,
    #[serde(default)]
    pub largest_groups_first: Option<bool>,
    #[serde(default)]
    pub max_imbalance_ratio: Option<f64>,

    #[serde(default)]
    pub template: TemplateSettings,
    #[serde(default)]
    pub retry: RetrySettings,
}

impl MirrorConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("TG_MIRROR_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TG_MIRROR")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("session_names")
                .with_list_parse_key("target_channels")
                .try_parsing(true),
        );
        builder.build()?.try_deserialize()
    }

    pub fn session_dir_or_default(&self) -> &str {
        self.session_dir.as_deref().unwrap_or("sessions")
    }

    pub fn download_dir_or_default(&self) -> &str {
        self.download_dir.as_deref().unwrap_or("downloads")
    }

    /// Per-call fetch batch size; the platform caps batch reads at 200 ids.
    pub fn fetch_batch_size_or_default(&self) -> usize {
        self.fetch_batch_size.unwrap_or(200)
    }

    pub fn download_threshold_bytes(&self) -> u64 {
        let mb = self.download_threshold_mb.unwrap_or(20.0);
        (mb * 1024.0 * 1024.0) as u64
    }

    pub fn concurrent_downloads_or_default(&self) -> usize {
        self.concurrent_downloads.unwrap_or(10)
    }

    pub fn stage_batch_size_or_default(&self) -> usize {
        self.stage_batch_size.unwrap_or(10)
    }

    pub fn upload_queue_size_or_default(&self) -> usize {
        self.upload_queue_size.unwrap_or(1000)
    }

    pub fn upload_consumers_or_default(&self) -> usize {
        self.upload_consumers.unwrap_or(1).max(1)
    }

    pub fn fanout_concurrency_or_default(&self) -> usize {
        self.fanout_concurrency.unwrap_or(3).max(1)
    }

    pub fn cleanup_after_success_or_default(&self) -> bool {
        self.cleanup_after_success.unwrap_or(true)
    }

    pub fn cleanup_after_failure_or_default(&self) -> bool {
        self.cleanup_after_failure.unwrap_or(false)
    }

    pub fn preserve_structure_or_default(&self) -> bool {
        self.preserve_structure.unwrap_or(false)
    }

    pub fn largest_groups_first_or_default(&self) -> bool {
        self.largest_groups_first.unwrap_or(true)
    }

    pub fn max_imbalance_ratio_or_default(&self) -> f64 {
        self.max_imbalance_ratio.unwrap_or(0.3)
    }

    pub fn publish_enabled(&self) -> bool {
        !self.target_channels.is_empty()
    }

    /// Startup validation. Every returned string is a distinct user-facing
    /// problem; a non-empty result aborts the run before any work.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.session_names.is_empty() {
            errors.push("at least one session name is required".into());
        }
        let mut seen = std::collections::HashSet::new();
        for name in &self.session_names {
            if !seen.insert(name.as_str()) {
                errors.push(format!("duplicate session name: {name}"));
            }
        }

        match self.api_id {
            Some(id) if id > 0 => {}
            _ => errors.push("api_id is required and must be positive".into()),
        }
        match self.api_hash.as_deref() {
            Some(hash) if hash.len() == 32 && hash.chars().all(|c| c.is_ascii_hexdigit()) => {}
            Some(_) => errors.push("api_hash must be 32 hex characters".into()),
            None => errors.push("api_hash is required".into()),
        }

        if let Some(proxy) = &self.proxy {
            if !matches!(proxy.scheme.as_str(), "socks5" | "socks4" | "http" | "https") {
                errors.push(format!("unsupported proxy scheme: {}", proxy.scheme));
            }
            if proxy.host.is_empty() {
                errors.push("proxy host must not be empty".into());
            }
        }

        if self.source_channel.as_deref().unwrap_or("").is_empty() {
            errors.push("source_channel is required".into());
        }
        match (self.start_id, self.end_id) {
            (Some(start), Some(end)) => {
                if start <= 0 || end <= 0 {
                    errors.push("message ids must be positive".into());
                }
                if start > end {
                    errors.push(format!("start_id {start} is greater than end_id {end}"));
                }
            }
            _ => errors.push("start_id and end_id are required".into()),
        }

        let batch = self.fetch_batch_size_or_default();
        if batch == 0 || batch > 200 {
            errors.push("fetch_batch_size must be between 1 and 200".into());
        }
        let stage = self.stage_batch_size_or_default();
        if stage == 0 || stage > 10 {
            errors.push("stage_batch_size must be between 1 and 10".into());
        }
        if self.concurrent_downloads_or_default() == 0 {
            errors.push("concurrent_downloads must be at least 1".into());
        }
        let ratio = self.max_imbalance_ratio_or_default();
        if !(0.0..=1.0).contains(&ratio) {
            errors.push("max_imbalance_ratio must be between 0 and 1".into());
        }

        if self.template.file.is_none() {
            if let Some(mode) = self.template.mode.as_deref() {
                if !matches!(mode, "original" | "custom") {
                    errors.push(format!("unknown template mode: {mode}"));
                }
                if mode == "custom" && self.template.body.as_deref().unwrap_or("").is_empty() {
                    errors.push("custom template mode: content required".into());
                }
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> MirrorConfig {
        MirrorConfig {
            session_names: vec!["a".into(), "b".into()],
            api_id: Some(12345),
            api_hash: Some("0123456789abcdef0123456789abcdef".into()),
            source_channel: Some("@channel".into()),
            start_id: Some(1),
            end_id: Some(100),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_empty());
    }

    #[test]
    fn test_missing_sessions_rejected() {
        let mut cfg = valid_config();
        cfg.session_names.clear();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.contains("session name")));
    }

    #[test]
    fn test_bad_api_hash_rejected() {
        let mut cfg = valid_config();
        cfg.api_hash = Some("not-hex".into());
        assert!(!cfg.validate().is_empty());
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut cfg = valid_config();
        cfg.start_id = Some(100);
        cfg.end_id = Some(1);
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.contains("greater than")));
    }

    #[test]
    fn test_batch_size_bounds() {
        let mut cfg = valid_config();
        cfg.fetch_batch_size = Some(201);
        assert!(!cfg.validate().is_empty());
        cfg.fetch_batch_size = Some(200);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn test_custom_template_requires_body() {
        let mut cfg = valid_config();
        cfg.template.mode = Some("custom".into());
        cfg.template.body = Some(String::new());
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.contains("content required")));
    }

    #[test]
    fn test_proxy_url_with_credentials() {
        let proxy = ProxyConfig {
            scheme: "socks5".into(),
            host: "127.0.0.1".into(),
            port: 1080,
            username: Some("u".into()),
            password: Some("p".into()),
        };
        assert_eq!(proxy.url(), "socks5://u:p@127.0.0.1:1080");
    }

    #[test]
    fn test_proxy_url_plain() {
        let proxy = ProxyConfig {
            scheme: "http".into(),
            host: "proxy.local".into(),
            port: 8080,
            username: None,
            password: None,
        };
        assert_eq!(proxy.url(), "http://proxy.local:8080");
    }

    #[test]
    fn test_threshold_conversion() {
        let mut cfg = valid_config();
        cfg.download_threshold_mb = Some(1.5);
        assert_eq!(cfg.download_threshold_bytes(), 1_572_864);
    }
}
