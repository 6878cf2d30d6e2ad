use std::path::PathBuf;

use tokio::time::Duration;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";
const DEFAULT_COOKIE_DOMAIN: &str = ".youtube.com";
const DEFAULT_MAX_CONCURRENT_CONVERSIONS: usize = 3;
const DEFAULT_EXTRACTION_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_STALE_SCRATCH_SECONDS: u64 = 2 * 60 * 60;

/// Runtime settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub allowed_origins: Vec<String>,
    pub output_dir: PathBuf,
    pub cookie_dir: PathBuf,
    pub yt_dlp_bin: String,
    pub extraction_timeout: Duration,
    pub max_concurrent_conversions: usize,
    pub cookie_domain: String,
    /// Scratch entries older than this are swept at startup. Zero disables the sweep.
    pub stale_scratch_after: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));

        Self {
            bind_addr: resolve_bind_addr(),
            allowed_origins: read_list_env("ALLOWED_ORIGINS"),
            output_dir: read_path_env("OUTPUT_DIR").unwrap_or_else(|| root.join("downloads")),
            cookie_dir: read_path_env("COOKIE_DIR").unwrap_or_else(|| root.join("cookies")),
            yt_dlp_bin: read_string_env("YT_DLP_BIN")
                .unwrap_or_else(|| DEFAULT_YT_DLP_BIN.to_string()),
            extraction_timeout: Duration::from_secs(
                read_u64_env("EXTRACTION_TIMEOUT_SECONDS")
                    .filter(|value| *value > 0)
                    .unwrap_or(DEFAULT_EXTRACTION_TIMEOUT_SECONDS),
            ),
            max_concurrent_conversions: read_usize_env("MAX_CONCURRENT_CONVERSIONS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_MAX_CONCURRENT_CONVERSIONS),
            cookie_domain: read_string_env("COOKIE_DOMAIN")
                .unwrap_or_else(|| DEFAULT_COOKIE_DOMAIN.to_string()),
            stale_scratch_after: Duration::from_secs(
                read_u64_env("STALE_SCRATCH_SECONDS").unwrap_or(DEFAULT_STALE_SCRATCH_SECONDS),
            ),
        }
    }
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn read_path_env(name: &str) -> Option<PathBuf> {
    read_string_env(name).map(PathBuf::from)
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn read_list_env(name: &str) -> Vec<String> {
    std::env::var(name)
        .ok()
        .map(|value| parse_list(&value))
        .unwrap_or_default()
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = read_string_env("APP_ADDR") {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_skips_blank_items() {
        assert_eq!(
            parse_list(" https://a.test , ,https://b.test,"),
            vec!["https://a.test".to_string(), "https://b.test".to_string()]
        );
        assert!(parse_list("  ").is_empty());
    }

    #[test]
    fn non_empty_trims_whitespace() {
        assert_eq!(non_empty("  abc "), Some("abc"));
        assert_eq!(non_empty(" \t"), None);
    }
}
