use std::{process::Stdio, sync::Arc};

use tokio::{
    process::Command,
    sync::Mutex,
    time::{Duration, Instant, timeout},
};
use tracing::{debug, info};

use crate::config::Config;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a probe result is trusted. Installation state changes rarely
/// within a process lifetime; a tool added or removed on the host is noticed
/// within this window, or immediately after `invalidate()`.
pub const PROBE_TTL: Duration = Duration::from_secs(300);

/// Ways of locating and running the extraction tool, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeStrategy {
    /// Bare `yt-dlp`, assuming it is on the search path.
    Direct,
    /// The filesystem path configured via `YTDLP_PATH`.
    CustomPath,
    /// `python3 -m yt_dlp`, for hosts where only the library is installed.
    InterpreterModule,
}

impl InvokeStrategy {
    pub const PRIORITY: [InvokeStrategy; 3] = [
        InvokeStrategy::Direct,
        InvokeStrategy::CustomPath,
        InvokeStrategy::InterpreterModule,
    ];

    pub fn command(self, config: &Config) -> Command {
        match self {
            InvokeStrategy::Direct => Command::new("yt-dlp"),
            InvokeStrategy::CustomPath => Command::new(&config.ytdlp_path),
            InvokeStrategy::InterpreterModule => {
                let mut command = Command::new(&config.python_path);
                command.arg("-m").arg("yt_dlp");
                command
            }
        }
    }

    pub fn method_name(self) -> &'static str {
        match self {
            InvokeStrategy::Direct => "direct",
            InvokeStrategy::CustomPath => "custom-path",
            InvokeStrategy::InterpreterModule => "interpreter-module",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ToolAvailability {
    pub strategy: Option<InvokeStrategy>,
}

impl ToolAvailability {
    pub fn available(&self) -> bool {
        self.strategy.is_some()
    }

    pub fn method_name(&self) -> &'static str {
        self.strategy
            .map(InvokeStrategy::method_name)
            .unwrap_or("none")
    }
}

struct CacheSlot<T> {
    value: T,
    probed_at: Instant,
}

impl<T: Copy> CacheSlot<T> {
    fn fresh(&self) -> Option<T> {
        (self.probed_at.elapsed() < PROBE_TTL).then_some(self.value)
    }
}

/// Single coordinating access point for tool availability. Probes shell out,
/// so results are cached for `PROBE_TTL` instead of re-probing per request.
pub struct ToolProbe {
    config: Arc<Config>,
    extractor: Mutex<Option<CacheSlot<ToolAvailability>>>,
    transcoder: Mutex<Option<CacheSlot<bool>>>,
}

impl ToolProbe {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            extractor: Mutex::new(None),
            transcoder: Mutex::new(None),
        }
    }

    /// Whether (and how) the extraction tool can be invoked.
    pub async fn extractor(&self) -> ToolAvailability {
        let mut slot = self.extractor.lock().await;
        if let Some(cached) = slot.as_ref().and_then(CacheSlot::fresh) {
            return cached;
        }

        let availability = self.probe_extractor().await;
        info!(method = availability.method_name(), "extractor probe");
        *slot = Some(CacheSlot {
            value: availability,
            probed_at: Instant::now(),
        });
        availability
    }

    /// Whether the transcoding helper is present. Its absence degrades
    /// quality (no merging) but is not fatal.
    pub async fn transcoder(&self) -> bool {
        let mut slot = self.transcoder.lock().await;
        if let Some(cached) = slot.as_ref().and_then(CacheSlot::fresh) {
            return cached;
        }

        let available = probe_ok(Command::new("ffmpeg"), &["-version"]).await;
        debug!(available, "transcoder probe");
        *slot = Some(CacheSlot {
            value: available,
            probed_at: Instant::now(),
        });
        available
    }

    /// Drops the cached extractor result so the next check re-probes,
    /// used when a spawn fails mid-request.
    pub async fn invalidate(&self) {
        *self.extractor.lock().await = None;
    }

    async fn probe_extractor(&self) -> ToolAvailability {
        for strategy in InvokeStrategy::PRIORITY {
            if probe_ok(strategy.command(&self.config), &["--version"]).await {
                return ToolAvailability {
                    strategy: Some(strategy),
                };
            }
        }
        ToolAvailability { strategy: None }
    }
}

async fn probe_ok(mut command: Command, args: &[&str]) -> bool {
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    matches!(
        timeout(PROBE_TIMEOUT, command.status()).await,
        Ok(Ok(status)) if status.success()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config() -> Config {
        Config {
            bind_addr: "127.0.0.1:0".to_string(),
            ytdlp_path: "/opt/tools/yt-dlp".to_string(),
            python_path: "python3".to_string(),
            ga_id: String::new(),
            adsense_client: String::new(),
            default_site_name: "Downloader-World".to_string(),
            domain_site_names: Default::default(),
            public_dir: PathBuf::from("public"),
            scratch_dir: PathBuf::from("temp"),
        }
    }

    #[test]
    fn strategies_build_expected_programs() {
        let config = test_config();

        let direct = InvokeStrategy::Direct.command(&config);
        assert_eq!(direct.as_std().get_program(), "yt-dlp");

        let custom = InvokeStrategy::CustomPath.command(&config);
        assert_eq!(custom.as_std().get_program(), "/opt/tools/yt-dlp");

        let module = InvokeStrategy::InterpreterModule.command(&config);
        assert_eq!(module.as_std().get_program(), "python3");
        let args: Vec<_> = module
            .as_std()
            .get_args()
            .map(|arg| arg.to_str().unwrap())
            .collect();
        assert_eq!(args, ["-m", "yt_dlp"]);
    }

    #[test]
    fn method_names_match_wire_values() {
        assert_eq!(InvokeStrategy::Direct.method_name(), "direct");
        assert_eq!(InvokeStrategy::CustomPath.method_name(), "custom-path");
        assert_eq!(
            InvokeStrategy::InterpreterModule.method_name(),
            "interpreter-module"
        );
        assert_eq!(ToolAvailability { strategy: None }.method_name(), "none");
    }

    #[tokio::test]
    async fn failed_probe_is_unavailable() {
        let mut config = test_config();
        config.ytdlp_path = "/nonexistent/yt-dlp".to_string();
        config.python_path = "/nonexistent/python3".to_string();
        let probe = ToolProbe::new(Arc::new(config));

        // No yt-dlp on the test host path either way; the chain must settle
        // on some answer without panicking, and invalidate must clear it.
        let first = probe.extractor().await;
        probe.invalidate().await;
        let second = probe.extractor().await;
        assert_eq!(first.available(), second.available());
    }
}
