//! Browser cookie strings to Netscape cookie-jar files for yt-dlp.

use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

pub const COOKIE_JAR_HEADER: &str = "# Netscape HTTP Cookie File";
const COOKIE_EXPIRY_EPOCH: i64 = 2_147_483_647;

/// Cookie name to value, parsed from a `name=value; name=value` blob.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CredentialSet {
    cookies: BTreeMap<String, String>,
}

impl CredentialSet {
    /// Segments without `=`, with an empty name, or with characters that would
    /// break the tab-separated jar are skipped. A repeated name keeps the last value.
    pub fn parse(raw: &str) -> Self {
        let mut cookies = BTreeMap::new();

        for segment in raw.split(';') {
            let Some((name, value)) = segment.trim().split_once('=') else {
                continue;
            };
            let name = name.trim();
            let value = value.trim();
            if name.is_empty() || has_jar_breaking_chars(name) || has_jar_breaking_chars(value) {
                continue;
            }
            cookies.insert(name.to_string(), value.to_string());
        }

        Self { cookies }
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn render_jar(&self, domain: &str) -> String {
        let mut jar = String::from(COOKIE_JAR_HEADER);
        jar.push('\n');

        for (name, value) in &self.cookies {
            jar.push_str(&format!(
                "{domain}\tTRUE\t/\t1\t{COOKIE_EXPIRY_EPOCH}\t{name}\t{value}\n"
            ));
        }

        jar
    }
}

fn has_jar_breaking_chars(value: &str) -> bool {
    value.chars().any(|character| matches!(character, '\t' | '\r' | '\n'))
}

pub fn staged_cookie_path(cookie_dir: &Path, job_id: Uuid) -> PathBuf {
    cookie_dir.join(format!("{job_id}.cookies.txt"))
}

/// Writes the jar to a fresh per-job file. Fails rather than overwrite an existing one.
pub async fn stage_cookie_file(
    cookie_dir: &Path,
    job_id: Uuid,
    credentials: &CredentialSet,
    domain: &str,
) -> std::io::Result<PathBuf> {
    let path = staged_cookie_path(cookie_dir, job_id);
    let contents = credentials.render_jar(domain);

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(&path).await?;
    let written = async {
        file.write_all(contents.as_bytes()).await?;
        file.flush().await
    }
    .await;

    if let Err(error) = written {
        drop(file);
        if let Err(cleanup_error) = tokio::fs::remove_file(&path).await
            && cleanup_error.kind() != ErrorKind::NotFound
        {
            warn!("No se pudo eliminar cookies incompletas {:?}: {cleanup_error}", path);
        }
        return Err(error);
    }

    Ok(path)
}
