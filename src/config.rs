use std::{collections::HashMap, path::PathBuf};

/// Environment-derived runtime configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub ytdlp_path: String,
    pub python_path: String,
    pub ga_id: String,
    pub adsense_client: String,
    pub default_site_name: String,
    pub domain_site_names: HashMap<String, String>,
    pub public_dir: PathBuf,
    pub scratch_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));

        Self {
            bind_addr: resolve_bind_addr(),
            ytdlp_path: env_or("YTDLP_PATH", "yt-dlp"),
            python_path: env_or("PYTHON_PATH", "python3"),
            ga_id: env_or("GA_MEASUREMENT_ID", ""),
            adsense_client: env_or("ADSENSE_CLIENT_ID", ""),
            default_site_name: env_or("DEFAULT_SITE_NAME", "Downloader-World"),
            domain_site_names: parse_domain_mappings(&env_or("DOMAIN_MAPPINGS", "")),
            public_dir: std::env::var("PUBLIC_DIR")
                .ok()
                .and_then(|value| non_empty(&value).map(PathBuf::from))
                .unwrap_or_else(|| root.join("public")),
            scratch_dir: std::env::var("SCRATCH_DIR")
                .ok()
                .and_then(|value| non_empty(&value).map(PathBuf::from))
                .unwrap_or_else(|| root.join("temp")),
        }
    }

    /// Site display name for a request's Host header. Exact domain match
    /// first, then substring match (covers subdomains), else the default.
    pub fn site_name_for_host(&self, host: Option<&str>) -> &str {
        let Some(host) = host else {
            return &self.default_site_name;
        };
        let host = host.to_ascii_lowercase();

        if let Some(name) = self.domain_site_names.get(&host) {
            return name;
        }
        for (domain, name) in &self.domain_site_names {
            if host.contains(domain.as_str()) {
                return name;
            }
        }
        &self.default_site_name
    }
}

/// `DOMAIN_MAPPINGS` format: `domain=Name,other.com=Other Name`.
fn parse_domain_mappings(raw: &str) -> HashMap<String, String> {
    let mut mappings = HashMap::new();
    for pair in raw.split(',') {
        if let Some((domain, name)) = pair.split_once('=') {
            let domain = domain.trim().to_ascii_lowercase();
            let name = name.trim();
            if !domain.is_empty() && !name.is_empty() {
                mappings.insert(domain, name.to_string());
            }
        }
    }
    mappings
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "0.0.0.0:3000".to_string()
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
        .unwrap_or_else(|| default.to_string())
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}
