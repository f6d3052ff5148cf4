use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use axum::body::Body;
use futures_util::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// File extensions considered downloadable media artifacts.
const ARTIFACT_EXTENSIONS: [&str; 2] = ["mp4", "webm"];

/// Artifacts older than this are deleted by the periodic sweep.
pub const ARTIFACT_MAX_AGE: Duration = Duration::from_secs(60 * 60);

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// A media file the extraction tool wrote into the scratch directory.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// Scratch directory used between artifact production and client delivery.
pub struct ArtifactStore {
    scratch_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(scratch_dir: PathBuf) -> Self {
        Self { scratch_dir }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub async fn ensure_scratch_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.scratch_dir).await
    }

    /// Media artifacts currently in the scratch directory, newest first.
    pub async fn list_artifacts(&self) -> Vec<Artifact> {
        let mut artifacts = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.scratch_dir).await {
            Ok(entries) => entries,
            Err(_) => return artifacts,
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !has_artifact_extension(&path) {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            artifacts.push(Artifact {
                path,
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        artifacts.sort_by(|a, b| b.modified.cmp(&a.modified));
        artifacts
    }

    /// Locates the artifact a specific invocation produced, by the unique
    /// token its output filename was templated with.
    pub async fn find_by_token(&self, token: &str) -> Option<Artifact> {
        self.list_artifacts()
            .await
            .into_iter()
            .find(|artifact| {
                artifact
                    .path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(token))
            })
    }

    /// Deletes everything in the scratch directory older than `max_age`.
    /// Individual delete failures are logged and skipped so one stuck file
    /// cannot halt the sweep.
    pub async fn sweep_expired(&self, max_age: Duration) {
        let mut entries = match tokio::fs::read_dir(&self.scratch_dir).await {
            Ok(entries) => entries,
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    warn!("could not open scratch directory for sweep: {error}");
                }
                return;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0usize;

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(error) => {
                    warn!("could not iterate scratch directory: {error}");
                    break;
                }
            };

            let path = entry.path();
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }

            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or(Duration::ZERO);
            if age < max_age {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => warn!("could not sweep {:?}: {error}", path),
            }
        }

        if removed > 0 {
            debug!(removed, "swept expired artifacts");
        }
    }

    /// Streams the artifact's bytes as a response body. The file is unlinked
    /// once the stream finishes or is dropped mid-transfer, so no artifact
    /// outlives its one-time delivery.
    pub async fn serve_and_delete(&self, artifact: &Artifact) -> std::io::Result<Body> {
        let file = tokio::fs::File::open(&artifact.path).await?;
        let guard = DeleteOnDrop {
            path: artifact.path.clone(),
        };

        let stream = ReaderStream::new(file).map(move |chunk| {
            let _keep_until_stream_ends = &guard;
            chunk
        });

        Ok(Body::from_stream(stream))
    }
}

struct DeleteOnDrop {
    path: PathBuf,
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path)
            && error.kind() != ErrorKind::NotFound
        {
            warn!("could not delete served artifact {:?}: {error}", self.path);
        }
    }
}

fn has_artifact_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            ARTIFACT_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        })
}
