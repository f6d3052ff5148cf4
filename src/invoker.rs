use std::{
    collections::HashMap,
    io::ErrorKind,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, timeout};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::{Config, non_empty},
    error::InvokeError,
    probe::{InvokeStrategy, ToolProbe},
    store::{Artifact, ArtifactStore},
};

const METADATA_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on a download invocation; a hung subprocess is killed rather
/// than left to hold resources indefinitely.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Files below this are treated as silently-truncated downloads or error
/// pages saved as video, not as valid artifacts.
pub const MIN_ARTIFACT_BYTES: u64 = 30_000;

/// Extensions surfaced in the quality ladder.
const FORMAT_EXTENSIONS: [&str; 3] = ["mp4", "webm", "m4a"];

const USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
];

/// Metadata summary for client display.
#[derive(Debug, Serialize)]
pub struct MediaInfo {
    pub title: String,
    pub thumbnail: String,
    pub duration: f64,
    pub uploader: String,
    pub available_qualities: Vec<QualityOption>,
}

/// One rung of the quality ladder: the largest variant at its resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityOption {
    pub quality: String,
    pub format_id: String,
    pub ext: String,
    pub filesize: u64,
}

/// A file the download invocation wrote, plus the client-facing filename
/// (the artifact name with the request token stripped).
#[derive(Debug)]
pub struct ProducedArtifact {
    pub artifact: Artifact,
    pub filename: String,
}

#[derive(Debug, Deserialize)]
struct ExtractorOutput {
    title: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<ExtractorThumbnail>,
    duration: Option<f64>,
    uploader: Option<String>,
    #[serde(default)]
    formats: Vec<ExtractorFormat>,
}

#[derive(Debug, Deserialize)]
struct ExtractorThumbnail {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExtractorFormat {
    format_id: String,
    ext: Option<String>,
    resolution: Option<String>,
    height: Option<u32>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
}

/// Spawns the extraction tool and resolves success or failure from its exit
/// code, output, and produced files.
pub struct Invoker {
    config: Arc<Config>,
    probe: Arc<ToolProbe>,
    store: Arc<ArtifactStore>,
    ua_cursor: AtomicUsize,
}

impl Invoker {
    pub fn new(config: Arc<Config>, probe: Arc<ToolProbe>, store: Arc<ArtifactStore>) -> Self {
        Self {
            config,
            probe,
            store,
            ua_cursor: AtomicUsize::new(0),
        }
    }

    /// Queries the tool for metadata and the deduplicated quality ladder.
    pub async fn fetch_metadata(&self, url: &str) -> Result<MediaInfo, InvokeError> {
        let args = [
            "--dump-json",
            "--no-playlist",
            "--no-warnings",
            "--",
            url,
        ];
        let output = self.run(&args, METADATA_TIMEOUT).await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if !output.status.success() || stdout.is_empty() {
            return Err(InvokeError::metadata_unavailable(&output.stderr));
        }

        let info: ExtractorOutput = serde_json::from_str(stdout).map_err(|error| {
            warn!("unparseable metadata output: {error}");
            InvokeError::MetadataUnavailable {
                detail: "could not parse the extractor's metadata output".to_string(),
            }
        })?;

        let thumbnail = info
            .thumbnail
            .as_deref()
            .and_then(non_empty)
            .map(ToString::to_string)
            .or_else(|| info.thumbnails.into_iter().find_map(|t| t.url))
            .unwrap_or_default();

        Ok(MediaInfo {
            title: info
                .title
                .as_deref()
                .and_then(non_empty)
                .unwrap_or("Untitled")
                .to_string(),
            thumbnail,
            duration: info.duration.unwrap_or(0.0),
            uploader: info.uploader.unwrap_or_default(),
            available_qualities: summarize_formats(&info.formats),
        })
    }

    /// Downloads a single progressive file into the scratch directory and
    /// validates the produced artifact.
    pub async fn download(
        &self,
        url: &str,
        format_id: Option<&str>,
        quality: Option<&str>,
    ) -> Result<ProducedArtifact, InvokeError> {
        self.store.ensure_scratch_dir().await?;

        let token = Uuid::new_v4().simple().to_string();
        let template = self
            .store
            .scratch_dir()
            .join(format!("{token}_%(title).120B.%(ext)s"))
            .to_string_lossy()
            .into_owned();
        let selector = format_selector(format_id);

        debug!(url, selector = %selector, quality = ?quality, "starting download");

        let args = [
            "-f",
            &selector,
            "-o",
            &template,
            "--no-playlist",
            "--no-warnings",
            "--user-agent",
            self.next_user_agent(),
            url,
        ];
        let output = self.run(&args, DOWNLOAD_TIMEOUT).await?;

        if !output.status.success() {
            return Err(InvokeError::extraction_failed(&output.stderr));
        }

        let artifact = self
            .store
            .find_by_token(&token)
            .await
            .ok_or(InvokeError::NoArtifactProduced)?;

        if let Err(error) = ensure_plausible_size(&artifact) {
            // An error page saved as video must not reach the client.
            if let Err(remove_error) = tokio::fs::remove_file(&artifact.path).await {
                warn!("could not remove undersized artifact: {remove_error}");
            }
            return Err(error);
        }

        let filename = client_filename(&artifact, &token);
        Ok(ProducedArtifact { artifact, filename })
    }

    /// Runs the tool through the first working invocation strategy. A
    /// strategy whose launcher cannot be spawned falls through to the next
    /// one; a launcher that ran and failed is terminal, since every strategy
    /// fronts the same extractor.
    async fn run(
        &self,
        args: &[&str],
        ceiling: Duration,
    ) -> Result<std::process::Output, InvokeError> {
        let availability = self.probe.extractor().await;
        let Some(first) = availability.strategy else {
            return Err(InvokeError::ExtractorNotFound);
        };

        let ordered = InvokeStrategy::PRIORITY
            .into_iter()
            .skip_while(|strategy| *strategy != first);

        for strategy in ordered {
            let mut command = strategy.command(&self.config);
            command
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            match timeout(ceiling, command.output()).await {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(error)) if error.kind() == ErrorKind::NotFound => {
                    warn!(
                        method = strategy.method_name(),
                        "launcher vanished since probe, trying next strategy"
                    );
                    self.probe.invalidate().await;
                }
                Ok(Err(error)) => return Err(InvokeError::Io(error)),
                Err(_) => return Err(InvokeError::TimedOut),
            }
        }

        Err(InvokeError::ExtractorNotFound)
    }

    fn next_user_agent(&self) -> &'static str {
        let index = self.ua_cursor.fetch_add(1, Ordering::Relaxed);
        USER_AGENTS[index % USER_AGENTS.len()]
    }
}

/// Prefer a single mp4 containing both tracks, else any best single file.
/// An explicit format id is tried first but still falls back to progressive.
fn format_selector(format_id: Option<&str>) -> String {
    match format_id.and_then(non_empty) {
        Some(id) => format!("{id}/best[ext=mp4]/best"),
        None => "best[ext=mp4]/best".to_string(),
    }
}

/// Builds the quality ladder: allowlisted extensions only, one entry per
/// resolution label (largest filesize wins), sorted by numeric resolution
/// descending. The dedup key is the label, not the codec.
fn summarize_formats(formats: &[ExtractorFormat]) -> Vec<QualityOption> {
    let mut best: HashMap<String, QualityOption> = HashMap::new();

    for format in formats {
        let Some(ext) = format.ext.as_deref() else {
            continue;
        };
        if !FORMAT_EXTENSIONS.contains(&ext) {
            continue;
        }

        let resolution = format
            .resolution
            .clone()
            .or_else(|| format.height.map(|height| format!("{height}p")))
            .unwrap_or_else(|| "audio only".to_string());
        if resolution == "audio only" {
            continue;
        }

        let filesize = format.filesize.or(format.filesize_approx).unwrap_or(0.0) as u64;
        let candidate = QualityOption {
            quality: resolution.clone(),
            format_id: format.format_id.clone(),
            ext: ext.to_string(),
            filesize,
        };

        match best.get(&resolution) {
            Some(existing) if existing.filesize >= filesize => {}
            _ => {
                best.insert(resolution, candidate);
            }
        }
    }

    let mut ladder: Vec<QualityOption> = best.into_values().collect();
    ladder.sort_by_key(|option| std::cmp::Reverse(leading_number(&option.quality)));
    ladder
}

/// Numeric prefix of a resolution label ("720p" -> 720); anything without
/// one sorts as 0.
fn leading_number(label: &str) -> u64 {
    let digits: String = label.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

fn ensure_plausible_size(artifact: &Artifact) -> Result<(), InvokeError> {
    if artifact.size < MIN_ARTIFACT_BYTES {
        return Err(InvokeError::ArtifactTooSmall {
            size: artifact.size,
        });
    }
    Ok(())
}

fn client_filename(artifact: &Artifact, token: &str) -> String {
    let name = artifact
        .path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("download.mp4");
    name.strip_prefix(&format!("{token}_"))
        .unwrap_or(name)
        .to_string()
}

/// Advisory hint for user messaging, derived from the tool's diagnostic
/// text. Never used to alter control flow.
pub fn hint_for(error: &InvokeError) -> &'static str {
    match error {
        InvokeError::ExtractorNotFound => {
            "The extraction tool is not installed on the server. Install yt-dlp and retry."
        }
        InvokeError::TimedOut => "The download took too long. Try a lower quality.",
        InvokeError::NoArtifactProduced | InvokeError::ArtifactTooSmall { .. } => {
            "Download failed. Try again, or try a different URL or quality."
        }
        _ => classify_diagnostic(error.detail()),
    }
}

fn classify_diagnostic(detail: &str) -> &'static str {
    let lower = detail.to_ascii_lowercase();

    if lower.contains("not installed")
        || lower.contains("command not found")
        || lower.contains("no such file")
    {
        "The extraction tool is not installed on the server. Install yt-dlp and retry."
    } else if lower.contains("age-restricted")
        || lower.contains("age restricted")
        || lower.contains("confirm your age")
    {
        "This video is age-restricted and cannot be downloaded anonymously."
    } else if lower.contains("sign in")
        || lower.contains("login required")
        || lower.contains("cookies")
        || lower.contains("authentication")
    {
        "This video requires signing in to the platform."
    } else if lower.contains("geo")
        || lower.contains("not available in your country")
        || lower.contains("blocked in your")
    {
        "This video is not available in your region."
    } else if lower.contains("video unavailable")
        || lower.contains("not available")
        || lower.contains("has been removed")
        || lower.contains("private")
        || lower.contains("does not exist")
    {
        "The video may have been deleted, made private, or is unavailable."
    } else {
        "Download failed. Try again, or try a different URL or quality."
    }
}
