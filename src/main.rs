mod config;
mod convert;
mod cookies;
mod error;
mod extractor;

use std::{collections::HashSet, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{State, rejection::JsonRejection},
    http::{
        HeaderMap, HeaderName, HeaderValue, Method,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio::{net::TcpListener, signal};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::Config,
    convert::{ConversionRequest, ConvertedAudio, Converter, sweep_stale_scratch},
    error::ConversionError,
    extractor::YtDlpExtractor,
};

const DOWNLOAD_FILENAME_HEADER: &str = "x-download-filename";

#[derive(Clone)]
struct AppState {
    converter: Arc<Converter>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "convert_backend=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ConversionError> {
    let config = Config::from_env();

    for dir in [&config.output_dir, &config.cookie_dir] {
        tokio::fs::create_dir_all(dir).await.map_err(|error| {
            ConversionError::internal(format!(
                "No se pudo crear la carpeta temporal {dir:?}: {error}"
            ))
        })?;
        let removed = sweep_stale_scratch(dir, config.stale_scratch_after).await;
        if removed > 0 {
            info!("Se eliminaron {removed} temporales antiguos de {:?}", dir);
        }
    }

    let extractor = YtDlpExtractor::new(config.yt_dlp_bin.clone(), config.extraction_timeout);
    let state = AppState {
        converter: Arc::new(Converter::new(
            Arc::new(extractor),
            config.output_dir.clone(),
            config.cookie_dir.clone(),
            config.cookie_domain.clone(),
            config.max_concurrent_conversions,
            config.stale_scratch_after,
        )),
    };

    info!(
        "Conversiones simultaneas: {}, tiempo limite: {}s, dominio de cookies: {}",
        config.max_concurrent_conversions,
        config.extraction_timeout.as_secs(),
        config.cookie_domain
    );

    let cors = build_cors_layer(&config.allowed_origins)?;
    let app = build_router(state, cors);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|error| {
            ConversionError::internal(format!(
                "No se pudo iniciar el puerto {}: {error}",
                config.bind_addr
            ))
        })?;

    info!("Backend listo en http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|error| ConversionError::internal(format!("Error del servidor HTTP: {error}")))
}

fn build_router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/api/health", get(health))
        .route("/convert", post(convert_audio))
        .route("/api/convert", post(convert_audio))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn shutdown_signal() {
    if let Err(error) = signal::ctrl_c().await {
        warn!("No se pudo escuchar Ctrl+C: {error}");
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "alive"}))
}

async fn convert_audio(
    State(state): State<AppState>,
    payload: Result<Json<ConversionRequest>, JsonRejection>,
) -> Result<Response, ConversionError> {
    let Json(request) = payload.map_err(|rejection| {
        ConversionError::invalid(format!("Cuerpo de solicitud invalido: {}", rejection.body_text()))
    })?;

    let converted = state.converter.convert(request).await?;
    audio_response(converted)
}

fn audio_response(converted: ConvertedAudio) -> Result<Response, ConversionError> {
    let (disposition, ascii_name) = download_name_headers(&converted.download_name)?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(converted.content_type));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(converted.content_length));
    headers.insert(CONTENT_DISPOSITION, disposition);
    headers.insert(HeaderName::from_static(DOWNLOAD_FILENAME_HEADER), ascii_name);

    debug!(
        job_id = %converted.job_id,
        path = ?converted.reader.path(),
        "Enviando {}",
        converted.download_name
    );

    // The job directory goes away when the body drops the reader.
    let body = Body::from_stream(ReaderStream::new(converted.reader));
    Ok((headers, body).into_response())
}

fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ConversionError> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        ]);

    if configured.is_empty() {
        warn!("ALLOWED_ORIGINS no esta configurado. Se aceptara cualquier origen.");
        return Ok(layer.allow_origin(Any));
    }

    let normalized_origins = configured
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ConversionError::internal(format!(
                    "Origen invalido en ALLOWED_ORIGINS: {origin}. Usa valores tipo https://dominio.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!(
        "CORS allow-list cargada con {} origen(es): {:?}",
        normalized_origins.len(),
        normalized_origins
    );

    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!(
            "CORS origin check raw={:?} normalized={:?} allowed={}",
            origin, normalized, allowed
        );
        allowed
    });

    Ok(layer.allow_origin(allow_origin))
}

/// `scheme://host[:port]` as browsers send it in `Origin`. Paths, queries and
/// non-web schemes are rejected rather than trimmed.
fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    if !matches!(parsed.scheme(), "http" | "https")
        || parsed.path() != "/"
        || parsed.query().is_some()
        || parsed.fragment().is_some()
    {
        return None;
    }
    parsed.host_str()?;

    // `Url` lowercases the host and forgets the scheme's default port.
    Some(parsed.origin().ascii_serialization())
}

/// `Content-Disposition` with an RFC 5987 `filename*`, plus the ASCII-only name
/// for `x-download-filename`.
fn download_name_headers(name: &str) -> Result<(HeaderValue, HeaderValue), ConversionError> {
    let fallback = ascii_fallback_name(name);
    let encoded = urlencoding::encode(name);
    let header = |value: String| {
        HeaderValue::try_from(value).map_err(|_| {
            ConversionError::internal("No se pudo crear la cabecera de descarga.")
        })
    };

    Ok((
        header(format!(
            "attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}"
        ))?,
        header(fallback)?,
    ))
}

/// Printable ASCII only, with quoting and path characters replaced. Runs of
/// replacements collapse into a single `_`.
fn ascii_fallback_name(name: &str) -> String {
    let mut fallback = String::with_capacity(name.len());
    for character in name.chars() {
        let keep = character == ' '
            || (character.is_ascii_graphic() && !matches!(character, '"' | '\\' | '/' | ';' | '%'));
        if keep {
            fallback.push(character);
        } else if !fallback.ends_with('_') {
            fallback.push('_');
        }
    }

    let fallback = fallback.trim();
    if fallback.chars().any(|character| character.is_ascii_alphanumeric()) {
        fallback.to_string()
    } else {
        "audio.bin".to_string()
    }
}
