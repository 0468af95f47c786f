use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tracing::info;

use axum_resume::{
    EntityTag, Error, FileContents, FileMeta, FileStream, KnownSize, PhysicalFile,
    RequestConditions, ResumeConfig, Resuming, ResumingResponse, VirtualFile,
};

const GREETING: &[u8] = b"0123456789abcdefghijklmnopgrstuvwxyzABCDEFGHIJKLMNOPGRSTUVWXYZ";

#[derive(Debug, Clone)]
struct AppState {
    root: PathBuf,
    config: ResumeConfig,
}

#[derive(Debug, Deserialize)]
struct FileRequest {
    path: String,
    /// Serve as an attachment under this name.
    download: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    // e.g. RESUME_CONFIG='{"buffer_size": 8192}'
    let config = match std::env::var("RESUME_CONFIG") {
        Ok(json) => serde_json::from_str(&json).expect("RESUME_CONFIG is not a valid config"),
        Err(_) => ResumeConfig::default(),
    };
    let root = std::env::current_dir().expect("no working directory");
    info!(root = %root.display(), ?config, "serving");

    let router = Router::new()
        .route("/contents", get(get_contents))
        .route("/stream", get(get_stream))
        .route("/physical", get(get_physical))
        .route("/virtual", get(get_virtual))
        .with_state(AppState { root, config });

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
    axum::serve(listener, router).await.unwrap();
}

/// Validators for a file on disk, derived from its length and modification
/// time.
async fn file_meta(path: &Path, download: Option<String>) -> Result<FileMeta, Error> {
    let metadata = tokio::fs::metadata(path).await?;
    let mut meta = FileMeta::guess(path);

    if let Ok(modified) = metadata.modified() {
        let secs = modified.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default();
        meta = meta
            .with_last_modified(modified)
            .with_entity_tag(EntityTag::strong(format!("{:x}-{:x}", secs, metadata.len())));
    }
    if let Some(name) = download {
        meta = meta.with_download_name(name);
    }
    Ok(meta)
}

async fn get_contents(
    State(state): State<AppState>,
    conditions: RequestConditions,
) -> Result<ResumingResponse<KnownSize<std::io::Cursor<bytes::Bytes>>>, Error> {
    let meta = FileMeta::new("text/plain").with_entity_tag(EntityTag::strong("greeting"));
    Resuming::new(FileContents::new(GREETING), meta)
        .with_config(state.config)
        .respond(&conditions)
        .await
}

async fn get_stream(
    State(state): State<AppState>,
    Query(request): Query<FileRequest>,
    conditions: RequestConditions,
) -> Result<ResumingResponse<KnownSize<tokio::fs::File>>, Error> {
    let path = state.root.join(&request.path);
    let meta = file_meta(&path, request.download).await?;
    let file = tokio::fs::File::open(&path).await?;

    Resuming::new(FileStream::new(KnownSize::file(file).await?), meta)
        .with_config(state.config)
        .respond(&conditions)
        .await
}

async fn get_physical(
    State(state): State<AppState>,
    Query(request): Query<FileRequest>,
    conditions: RequestConditions,
) -> Result<ResumingResponse<KnownSize<tokio::fs::File>>, Error> {
    let file = PhysicalFile::new(&request.path).await?;
    let meta = file_meta(file.path(), request.download).await?;

    Resuming::new(file, meta)
        .with_config(state.config)
        .respond(&conditions)
        .await
}

async fn get_virtual(
    State(state): State<AppState>,
    Query(request): Query<FileRequest>,
    conditions: RequestConditions,
) -> Result<ResumingResponse<KnownSize<tokio::fs::File>>, Error> {
    let file = VirtualFile::resolve(&state.root, &request.path).await?;
    let meta = file_meta(file.path(), request.download).await?;

    Resuming::new(file, meta)
        .with_config(state.config)
        .respond(&conditions)
        .await
}
