use std::{
    ffi::OsStr,
    io::ErrorKind,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use serde::Deserialize;
use tokio::{
    io::{AsyncRead, ReadBuf},
    sync::Semaphore,
    time::Duration,
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    config::non_empty,
    cookies::{CredentialSet, stage_cookie_file},
    error::ConversionError,
    extractor::{AudioFormat, ExtractionJob, Extractor, content_type_for_path, is_valid_quality},
};

const DOWNLOAD_NAME_MAX_CHARS: usize = 150;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversionRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub cookies: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
}

#[derive(Debug)]
struct ValidatedRequest {
    url: String,
    format: AudioFormat,
    cookies: Option<String>,
    quality: Option<String>,
}

impl ConversionRequest {
    fn validate(self) -> Result<ValidatedRequest, ConversionError> {
        let url = non_empty(&self.url)
            .ok_or_else(|| ConversionError::invalid("Ingresa una URL valida."))?;
        if !is_http_url(url) {
            return Err(ConversionError::invalid(
                "La URL debe ser una direccion http o https valida.",
            ));
        }

        let format = non_empty(&self.format)
            .ok_or_else(|| ConversionError::invalid("Indica el formato de audio de salida."))?
            .parse::<AudioFormat>()
            .map_err(|error| {
                let supported = AudioFormat::ALL.map(AudioFormat::codec).join(", ");
                ConversionError::invalid(format!("{error}. Usa uno de: {supported}."))
            })?;

        let quality = self
            .quality
            .as_deref()
            .and_then(non_empty)
            .map(ToString::to_string);
        if let Some(quality) = &quality
            && !is_valid_quality(quality)
        {
            return Err(ConversionError::invalid(format!(
                "Calidad de audio invalida: {quality}. Usa 0-10 o un bitrate como 192K."
            )));
        }

        Ok(ValidatedRequest {
            url: url.to_string(),
            format,
            cookies: self.cookies,
            quality,
        })
    }
}

fn is_http_url(input: &str) -> bool {
    Url::parse(input).is_ok_and(|parsed| {
        matches!(parsed.scheme(), "http" | "https")
            && parsed.host_str().is_some_and(|host| !host.is_empty())
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScratchKind {
    File,
    Dir,
}

/// A per-job file or directory that is deleted when dropped, unless removed explicitly first.
#[derive(Debug)]
pub struct ScratchEntry {
    path: PathBuf,
    kind: ScratchKind,
    armed: bool,
}

impl ScratchEntry {
    pub fn file(path: PathBuf) -> Self {
        Self {
            path,
            kind: ScratchKind::File,
            armed: true,
        }
    }

    pub fn dir(path: PathBuf) -> Self {
        Self {
            path,
            kind: ScratchKind::Dir,
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(mut self) {
        self.armed = false;
        let removed = match self.kind {
            ScratchKind::File => tokio::fs::remove_file(&self.path).await,
            ScratchKind::Dir => tokio::fs::remove_dir_all(&self.path).await,
        };
        report_cleanup(&self.path, removed);
    }
}

impl Drop for ScratchEntry {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Drop cannot await, and it also runs while an aborted task is torn down,
        // so only the blocking calls are sure to finish here.
        let removed = match self.kind {
            ScratchKind::File => std::fs::remove_file(&self.path),
            ScratchKind::Dir => std::fs::remove_dir_all(&self.path),
        };
        report_cleanup(&self.path, removed);
    }
}

fn report_cleanup(path: &Path, removed: std::io::Result<()>) {
    if let Err(error) = removed
        && error.kind() != ErrorKind::NotFound
    {
        warn!("No se pudo eliminar temporal {:?}: {error}", path);
    }
}

/// Reads the converted file. Dropping it removes the whole job directory.
#[derive(Debug)]
pub struct ArtifactReader {
    file: tokio::fs::File,
    path: PathBuf,
    _job_dir: ScratchEntry,
}

impl ArtifactReader {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsyncRead for ArtifactReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

#[derive(Debug)]
pub struct ConvertedAudio {
    pub job_id: Uuid,
    pub reader: ArtifactReader,
    pub content_length: u64,
    pub format: AudioFormat,
    /// Derived from the file yt-dlp actually wrote, not from the requested format.
    pub content_type: &'static str,
    pub download_name: String,
}

pub struct Converter {
    extractor: Arc<dyn Extractor>,
    output_dir: PathBuf,
    cookie_dir: PathBuf,
    cookie_domain: String,
    stale_after: Duration,
    permits: Semaphore,
}

impl Converter {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        output_dir: PathBuf,
        cookie_dir: PathBuf,
        cookie_domain: String,
        max_concurrent: usize,
        stale_after: Duration,
    ) -> Self {
        Self {
            extractor,
            output_dir,
            cookie_dir,
            cookie_domain,
            stale_after,
            permits: Semaphore::new(max_concurrent.max(1)),
        }
    }

    pub async fn convert(
        &self,
        request: ConversionRequest,
    ) -> Result<ConvertedAudio, ConversionError> {
        let request = request.validate()?;
        self.sweep_leftovers().await;

        let job_id = Uuid::new_v4();
        info!(%job_id, format = %request.format, "Nueva conversion para {}", request.url);

        let result = self.run_job(job_id, request).await;
        if let Err(error) = &result {
            warn!(%job_id, "Conversion fallida: {error}");
        }
        result
    }

    async fn sweep_leftovers(&self) {
        let removed = sweep_stale_scratch(&self.output_dir, self.stale_after).await
            + sweep_stale_scratch(&self.cookie_dir, self.stale_after).await;
        if removed > 0 {
            info!("Se limpiaron {removed} temporales antiguos");
        }
    }

    async fn run_job(
        &self,
        job_id: Uuid,
        request: ValidatedRequest,
    ) -> Result<ConvertedAudio, ConversionError> {
        let job_dir = self.output_dir.join(job_id.to_string());
        tokio::fs::create_dir(&job_dir).await.map_err(|error| {
            ConversionError::internal(format!("No se pudo crear carpeta del trabajo: {error}"))
        })?;
        let job_dir = ScratchEntry::dir(job_dir);

        let staged_cookies = self
            .stage_credentials(job_id, request.cookies.as_deref())
            .await?;

        let job = ExtractionJob {
            source_url: request.url,
            target_format: request.format,
            output_path: job_dir
                .path()
                .join(format!("{job_id}.{}", request.format.extension())),
            credential_file: staged_cookies
                .as_ref()
                .map(|staged| staged.path().to_path_buf()),
            quality: request.quality,
        };

        let extracted = {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| ConversionError::internal("No se pudo reservar capacidad de conversion."))?;
            self.extractor.extract(&job).await
        };

        if let Some(staged) = staged_cookies {
            staged.remove().await;
        }

        let outcome =
            extracted.map_err(|error| ConversionError::Extraction(error.into_message()))?;

        let artifact =
            locate_artifact(job_dir.path(), &job.output_path, outcome.output_path.as_deref())
                .await?;
        let file = tokio::fs::File::open(&artifact).await.map_err(|error| {
            ConversionError::internal(format!("No se pudo abrir el audio convertido: {error}"))
        })?;
        let content_length = file
            .metadata()
            .await
            .map_err(|error| {
                ConversionError::internal(format!(
                    "No se pudo leer metadata del audio convertido: {error}"
                ))
            })?
            .len();

        let extension = artifact
            .extension()
            .and_then(OsStr::to_str)
            .unwrap_or(job.target_format.extension());
        let content_type = content_type_for_path(&artifact);
        let download_name = download_name(outcome.title.as_deref(), extension);

        info!(%job_id, bytes = content_length, "Conversion lista");

        Ok(ConvertedAudio {
            job_id,
            reader: ArtifactReader {
                file,
                path: artifact,
                _job_dir: job_dir,
            },
            content_length,
            format: job.target_format,
            content_type,
            download_name,
        })
    }

    async fn stage_credentials(
        &self,
        job_id: Uuid,
        raw: Option<&str>,
    ) -> Result<Option<ScratchEntry>, ConversionError> {
        let Some(raw) = raw.and_then(non_empty) else {
            return Ok(None);
        };

        let credentials = CredentialSet::parse(raw);
        if credentials.is_empty() {
            debug!(%job_id, "Las cookies recibidas no contienen pares validos");
            return Ok(None);
        }

        let path = stage_cookie_file(&self.cookie_dir, job_id, &credentials, &self.cookie_domain)
            .await
            .map_err(ConversionError::CredentialStaging)?;
        debug!(%job_id, cookies = credentials.len(), "Cookies temporales preparadas");

        Ok(Some(ScratchEntry::file(path)))
    }
}

/// Finds the converted file, preferring the path yt-dlp printed. Anything that
/// resolves outside `job_dir` is ignored.
async fn locate_artifact(
    job_dir: &Path,
    expected: &Path,
    printed: Option<&Path>,
) -> Result<PathBuf, ConversionError> {
    let scope = tokio::fs::canonicalize(job_dir).await.map_err(|error| {
        ConversionError::internal(format!("No se pudo resolver carpeta del trabajo: {error}"))
    })?;

    // `join` keeps absolute printed paths as they are.
    let named = printed.map(|path| job_dir.join(path));
    for candidate in named.iter().map(PathBuf::as_path).chain([expected]) {
        if let Some(found) = confined_file(&scope, candidate).await? {
            return Ok(found);
        }
    }

    let mut entries = tokio::fs::read_dir(job_dir).await.map_err(|error| {
        ConversionError::internal(format!("No se pudo abrir carpeta del trabajo: {error}"))
    })?;
    while let Some(entry) = entries.next_entry().await.map_err(|error| {
        ConversionError::internal(format!("No se pudo listar carpeta del trabajo: {error}"))
    })? {
        let path = entry.path();
        if is_partial_download(&path) {
            continue;
        }
        if let Some(found) = confined_file(&scope, &path).await? {
            return Ok(found);
        }
    }

    Err(ConversionError::ArtifactMissing)
}

async fn confined_file(scope: &Path, candidate: &Path) -> Result<Option<PathBuf>, ConversionError> {
    let resolved = match tokio::fs::canonicalize(candidate).await {
        Ok(resolved) => resolved,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(ConversionError::internal(format!(
                "No se pudo resolver el audio convertido: {error}"
            )));
        }
    };

    if !resolved.starts_with(scope) {
        warn!("Se ignoro un archivo fuera de la carpeta del trabajo: {:?}", resolved);
        return Ok(None);
    }

    let is_file = tokio::fs::metadata(&resolved)
        .await
        .is_ok_and(|metadata| metadata.is_file());
    Ok(is_file.then_some(resolved))
}

fn is_partial_download(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|extension| matches!(extension, "part" | "ytdl" | "temp"))
}

/// Caller-facing file name built from the media title, never from the job id.
pub fn download_name(title: Option<&str>, extension: &str) -> String {
    let stem = title
        .map(|value| {
            value
                .chars()
                .map(|character| {
                    if character.is_control() || matches!(character, '/' | '\\') {
                        '_'
                    } else {
                        character
                    }
                })
                .take(DOWNLOAD_NAME_MAX_CHARS)
                .collect::<String>()
        })
        .and_then(|value| non_empty(&value).map(ToString::to_string))
        .unwrap_or_else(|| "audio".to_string());

    format!("{stem}.{extension}")
}

/// Deletes scratch entries older than `max_age`, left behind by a previous crash.
pub async fn sweep_stale_scratch(dir: &Path, max_age: Duration) -> usize {
    if max_age.is_zero() {
        return 0;
    }

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("No se pudo abrir carpeta temporal para limpieza: {error}");
            }
            return 0;
        }
    };

    let now = std::time::SystemTime::now();
    let mut removed = 0;

    loop {
        let maybe_entry = match entries.next_entry().await {
            Ok(value) => value,
            Err(error) => {
                warn!("No se pudo iterar carpeta temporal para limpieza: {error}");
                break;
            }
        };

        let Some(entry) = maybe_entry else {
            break;
        };

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("No se pudo leer metadata de {:?}: {error}", path);
                continue;
            }
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified_at| now.duration_since(modified_at).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        let outcome = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };

        match outcome {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("No se pudo eliminar temporal {:?}: {error}", path),
        }
    }

    removed
}
