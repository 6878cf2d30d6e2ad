use std::{
    ffi::OsString,
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    process::Command,
    time::{Duration, timeout},
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Mp3,
    Wav,
    M4a,
    Aac,
    Flac,
    Opus,
    Vorbis,
}

impl AudioFormat {
    pub const ALL: [AudioFormat; 7] = [
        AudioFormat::Mp3,
        AudioFormat::Wav,
        AudioFormat::M4a,
        AudioFormat::Aac,
        AudioFormat::Flac,
        AudioFormat::Opus,
        AudioFormat::Vorbis,
    ];

    /// Value passed to `--audio-format`.
    pub fn codec(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
            AudioFormat::M4a => "m4a",
            AudioFormat::Aac => "aac",
            AudioFormat::Flac => "flac",
            AudioFormat::Opus => "opus",
            AudioFormat::Vorbis => "vorbis",
        }
    }

    /// Extension yt-dlp normally gives the converted file. Only a hint: the
    /// real path is the one yt-dlp prints after moving the file.
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Vorbis => "ogg",
            AudioFormat::Aac => "m4a",
            other => other.codec(),
        }
    }
}

pub fn content_type_for_path(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "m4a" | "mp4" => "audio/mp4",
        "aac" => "audio/aac",
        "flac" => "audio/flac",
        "ogg" | "opus" | "oga" => "audio/ogg",
        "webm" => "audio/webm",
        _ => "application/octet-stream",
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.codec())
    }
}

#[derive(Debug, Error)]
#[error("formato de audio no soportado: {0}")]
pub struct UnsupportedFormat(String);

impl FromStr for AudioFormat {
    type Err = UnsupportedFormat;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        if normalized == "ogg" {
            return Ok(AudioFormat::Vorbis);
        }

        AudioFormat::ALL
            .into_iter()
            .find(|format| format.codec() == normalized)
            .ok_or_else(|| UnsupportedFormat(value.trim().to_string()))
    }
}

/// Accepts a VBR level `0`..=`10` or a bitrate such as `192K`.
pub fn is_valid_quality(value: &str) -> bool {
    if let Ok(level) = value.parse::<u8>() {
        return level <= 10;
    }

    let Some(digits) = value
        .strip_suffix('K')
        .or_else(|| value.strip_suffix('k'))
    else {
        return false;
    };

    !digits.is_empty()
        && digits.chars().all(|character| character.is_ascii_digit())
        && digits.parse::<u32>().is_ok_and(|bitrate| bitrate > 0)
}

#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub source_url: String,
    pub target_format: AudioFormat,
    /// Target file inside the job directory. yt-dlp may swap the extension.
    pub output_path: PathBuf,
    pub credential_file: Option<PathBuf>,
    pub quality: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractionOutcome {
    pub title: Option<String>,
    /// Final location reported by the extractor, if it reported one.
    pub output_path: Option<PathBuf>,
}

/// The extractor's own diagnostic. Never inspected, only relayed.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ExtractionError {
    message: String,
}

impl ExtractionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn into_message(self) -> String {
        self.message
    }
}

/// Resolves a URL into an audio file next to `job.output_path`.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, job: &ExtractionJob) -> Result<ExtractionOutcome, ExtractionError>;
}

#[derive(Debug, Clone)]
pub struct YtDlpExtractor {
    binary: String,
    timeout: Duration,
}

impl YtDlpExtractor {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Extractor for YtDlpExtractor {
    async fn extract(&self, job: &ExtractionJob) -> Result<ExtractionOutcome, ExtractionError> {
        let args = build_yt_dlp_args(job);
        debug!("Ejecutando {} con {} argumentos", self.binary, args.len());

        let command_future = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = timeout(self.timeout, command_future)
            .await
            .map_err(|_| {
                ExtractionError::new(format!(
                    "La conversion excedio el tiempo limite de {} segundos.",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    ExtractionError::new(format!(
                        "{} no esta instalado en el sistema. Instalalo y reinicia el backend.",
                        self.binary
                    ))
                } else {
                    ExtractionError::new(format!("No se pudo ejecutar {}: {error}", self.binary))
                }
            })?;

        if !output.status.success() {
            return Err(ExtractionError::new(last_line(&output.stderr).unwrap_or_else(
                || format!("{} termino con estado {}", self.binary, output.status),
            )));
        }

        Ok(parse_printed_outcome(&output.stdout))
    }
}

pub fn build_yt_dlp_args(job: &ExtractionJob) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "--no-playlist",
        "--no-warnings",
        "-f",
        "bestaudio/best",
        "-x",
        "--audio-format",
        job.target_format.codec(),
    ]
    .into_iter()
    .map(OsString::from)
    .collect();

    if let Some(quality) = &job.quality {
        args.push("--audio-quality".into());
        args.push(quality.into());
    }

    if let Some(credential_file) = &job.credential_file {
        args.push("--cookies".into());
        args.push(credential_file.into());
    }

    args.push("--print".into());
    args.push("after_move:title".into());
    args.push("--print".into());
    args.push("after_move:filepath".into());
    args.push("-o".into());
    args.push(output_template(&job.output_path));
    args.push("--".into());
    args.push((&job.source_url).into());

    args
}

/// yt-dlp picks the final extension itself after conversion.
fn output_template(output_path: &Path) -> OsString {
    let mut template = output_path.with_extension("").into_os_string();
    template.push(".%(ext)s");
    template
}

/// Stdout ends with the title line followed by the final file path.
fn parse_printed_outcome(stdout: &[u8]) -> ExtractionOutcome {
    let text = String::from_utf8_lossy(stdout);
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    let (title, path) = match lines.as_slice() {
        [.., title, path] => (Some(*title), Some(*path)),
        [path] => (None, Some(*path)),
        [] => (None, None),
    };

    ExtractionOutcome {
        title: title
            .filter(|title| *title != "NA")
            .map(ToString::to_string),
        output_path: path.filter(|path| *path != "NA").map(PathBuf::from),
    }
}

fn last_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(credential_file: Option<&str>, quality: Option<&str>) -> ExtractionJob {
        ExtractionJob {
            source_url: "https://www.youtube.com/watch?v=abc".to_string(),
            target_format: AudioFormat::Vorbis,
            output_path: PathBuf::from("/tmp/out/1234.ogg"),
            credential_file: credential_file.map(PathBuf::from),
            quality: quality.map(ToString::to_string),
        }
    }

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn parses_formats_case_insensitively() {
        assert_eq!(" MP3 ".parse::<AudioFormat>().unwrap(), AudioFormat::Mp3);
        assert_eq!("ogg".parse::<AudioFormat>().unwrap(), AudioFormat::Vorbis);
        assert_eq!("vorbis".parse::<AudioFormat>().unwrap().extension(), "ogg");
        assert!("mp4".parse::<AudioFormat>().is_err());
        assert!("".parse::<AudioFormat>().is_err());
    }

    #[test]
    fn validates_quality_values() {
        assert!(is_valid_quality("0"));
        assert!(is_valid_quality("10"));
        assert!(is_valid_quality("192K"));
        assert!(is_valid_quality("320k"));
        assert!(!is_valid_quality("11"));
        assert!(!is_valid_quality("K"));
        assert!(!is_valid_quality("0K"));
        assert!(!is_valid_quality("-1"));
        assert!(!is_valid_quality("best"));
    }

    #[test]
    fn args_without_credentials_omit_cookies_flag() {
        let args = strings(build_yt_dlp_args(&job(None, None)));
        assert!(!args.iter().any(|arg| arg == "--cookies"));
        assert!(!args.iter().any(|arg| arg == "--audio-quality"));
        assert_eq!(args.last().unwrap(), "https://www.youtube.com/watch?v=abc");
        assert_eq!(args[args.len() - 2], "--");
    }

    #[test]
    fn args_carry_format_quality_cookies_and_template() {
        let args = strings(build_yt_dlp_args(&job(Some("/tmp/c/1234.cookies.txt"), Some("5"))));
        let after = |flag: &str| {
            let index = args.iter().position(|arg| arg == flag).unwrap();
            args[index + 1].clone()
        };
        assert_eq!(after("--audio-format"), "vorbis");
        assert_eq!(after("--audio-quality"), "5");
        assert_eq!(after("--cookies"), "/tmp/c/1234.cookies.txt");
        assert_eq!(after("-o"), "/tmp/out/1234.%(ext)s");
        assert_eq!(after("--print"), "after_move:title");
        assert!(args.iter().any(|arg| arg == "after_move:filepath"));
    }

    #[test]
    fn printed_outcome_takes_title_then_path() {
        let outcome = parse_printed_outcome(b"[info] x\nMy song\n/tmp/out/1234.m4a\n");
        assert_eq!(outcome.title.as_deref(), Some("My song"));
        assert_eq!(outcome.output_path, Some(PathBuf::from("/tmp/out/1234.m4a")));

        let outcome = parse_printed_outcome(b"NA\n/tmp/out/1234.wav\n");
        assert_eq!(outcome.title, None);
        assert_eq!(outcome.output_path, Some(PathBuf::from("/tmp/out/1234.wav")));

        let outcome = parse_printed_outcome(b"");
        assert!(outcome.title.is_none() && outcome.output_path.is_none());
    }

    #[test]
    fn content_type_follows_the_real_file() {
        assert_eq!(AudioFormat::Aac.extension(), "m4a");
        assert_eq!(content_type_for_path(Path::new("/x/1234.m4a")), "audio/mp4");
        assert_eq!(content_type_for_path(Path::new("/x/1234.OGG")), "audio/ogg");
        assert_eq!(content_type_for_path(Path::new("/x/1234")), "application/octet-stream");
    }

    #[test]
    fn last_line_ignores_trailing_blank_lines() {
        assert_eq!(
            last_line(b"WARNING: x\nERROR: Unsupported URL\n\n").as_deref(),
            Some("ERROR: Unsupported URL")
        );
        assert_eq!(last_line(b"  \n"), None);
    }

    #[tokio::test]
    async fn missing_binary_is_an_extraction_error() {
        let extractor = YtDlpExtractor::new("definitely-not-a-real-yt-dlp", Duration::from_secs(5));
        let error = extractor.extract(&job(None, None)).await.unwrap_err();
        assert!(error.to_string().contains("no esta instalado"));
    }
}
