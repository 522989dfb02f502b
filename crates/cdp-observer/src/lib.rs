//! Pagewatch CDP observation layer.
//!
//! Owns the remote-debugging transport and the target graph: every
//! execution context the observed page spawns is attached, instrumented
//! for network/page observation, and its notifications normalized into
//! pipeline events. Nothing here mutates page behavior.

use std::{env, path::PathBuf, sync::Arc};

use tracing::{info, warn};
use which::which;

pub mod correlator;
pub mod metrics;
pub mod observer;
pub mod registry;
pub mod transport;
mod util;

use crate::config::ObserverConfig;
use crate::transport::{CdpTransport, ChromiumTransport, NoopTransport};

pub mod error {
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use thiserror::Error;

    /// High-level error categories surfaced by the observation layer.
    #[derive(Clone, Debug, Error, Serialize, Deserialize)]
    pub enum ObserverErrorKind {
        #[error("cdp i/o failure")]
        CdpIo,
        #[error("command timed out")]
        Timeout,
        #[error("protocol payload malformed")]
        Protocol,
        #[error("internal error")]
        Internal,
    }

    /// Enriched error metadata passed back to the session runner.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct ObserverError {
        pub kind: ObserverErrorKind,
        pub hint: Option<String>,
        pub retriable: bool,
    }

    impl fmt::Display for ObserverError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.kind)?;
            if let Some(hint) = &self.hint {
                write!(f, ": {}", hint)?;
            }
            Ok(())
        }
    }

    impl std::error::Error for ObserverError {}

    impl ObserverError {
        pub fn new(kind: ObserverErrorKind) -> Self {
            Self {
                kind,
                hint: None,
                retriable: false,
            }
        }

        pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
            self.hint = Some(hint.into());
            self
        }

        pub fn retriable(mut self, flag: bool) -> Self {
            self.retriable = flag;
            self
        }
    }
}

pub mod config {
    use crate::detect_chrome_executable;
    use serde::{Deserialize, Serialize};
    use std::{env, path::PathBuf};

    /// Configuration for the observation transport and target graph.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct ObserverConfig {
        pub executable: PathBuf,
        pub user_data_dir: PathBuf,
        pub headless: bool,
        pub websocket_url: Option<String>,
        pub default_deadline_ms: u64,
        pub heartbeat_interval_ms: u64,
        /// Host-layer sweep for popups the auto-attach chain misses.
        pub popup_sweep_interval_ms: u64,
        pub network_total_buffer_bytes: u64,
        pub network_resource_buffer_bytes: u64,
        /// Binding name the in-page probe reports through.
        pub probe_binding: String,
    }

    impl Default for ObserverConfig {
        fn default() -> Self {
            Self {
                executable: detect_chrome_executable().unwrap_or_default(),
                user_data_dir: default_profile_dir(),
                headless: resolve_headless_default(),
                websocket_url: resolve_ws_url(),
                default_deadline_ms: 30_000,
                heartbeat_interval_ms: 15_000,
                popup_sweep_interval_ms: 1_500,
                network_total_buffer_bytes: 8 * 1024 * 1024,
                network_resource_buffer_bytes: 2 * 1024 * 1024,
                probe_binding: "__pagewatch_probe".to_string(),
            }
        }
    }

    fn resolve_headless_default() -> bool {
        match env::var("PAGEWATCH_HEADLESS") {
            Ok(value) => {
                let lower = value.to_ascii_lowercase();
                !matches!(lower.as_str(), "0" | "false" | "no" | "off")
            }
            Err(_) => true,
        }
    }

    fn resolve_ws_url() -> Option<String> {
        match env::var("PAGEWATCH_WS_URL") {
            Ok(value) => {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Err(_) => None,
        }
    }

    fn default_profile_dir() -> PathBuf {
        if let Ok(path) = env::var("PAGEWATCH_PROFILE") {
            return PathBuf::from(path);
        }
        PathBuf::from("./.pagewatch-profile")
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObserverMode {
    Real,
    Stub,
}

impl ObserverMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObserverMode::Real => "real",
            ObserverMode::Stub => "stub",
        }
    }

    pub fn is_stub(&self) -> bool {
        matches!(self, ObserverMode::Stub)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ChromeMode {
    Auto,
    ForceReal,
    ForceStub,
}

fn chrome_mode() -> ChromeMode {
    match env::var("PAGEWATCH_USE_REAL_CHROME")
        .unwrap_or_default()
        .to_ascii_lowercase()
        .as_str()
    {
        "1" | "true" | "yes" | "on" => ChromeMode::ForceReal,
        "0" | "false" | "no" | "off" => ChromeMode::ForceStub,
        _ => ChromeMode::Auto,
    }
}

/// Selects a transport for the given configuration: the real Chromium
/// transport when a browser is reachable, a stub otherwise so that the
/// rest of the stack keeps working on hosts without Chrome.
pub fn build_transport(cfg: &mut ObserverConfig) -> (Arc<dyn CdpTransport>, ObserverMode) {
    let mode = chrome_mode();
    let detected = resolve_chrome_path(cfg);
    let wants_stub = matches!(mode, ChromeMode::ForceStub);
    let mut use_real = cfg.websocket_url.is_some() || matches!(mode, ChromeMode::ForceReal);
    if !use_real && !wants_stub {
        use_real = detected.is_some();
    }

    if use_real && cfg.websocket_url.is_none() {
        if let Some(path) = detected {
            cfg.executable = path;
        } else {
            if matches!(mode, ChromeMode::ForceReal) {
                panic!("Chrome/Chromium executable not found while PAGEWATCH_USE_REAL_CHROME=1");
            }
            warn!(
                target: "cdp-observer",
                "Chrome executable not found; falling back to stub transport"
            );
            use_real = false;
        }
    }

    if use_real {
        info!(target: "cdp-observer", "using real Chromium transport");
        (Arc::new(ChromiumTransport::new(cfg.clone())), ObserverMode::Real)
    } else {
        warn!(
            target: "cdp-observer",
            remediation = "Install Chrome/Chromium and set PAGEWATCH_CHROME=/path/to/chrome or pass --ws-url",
            "observer initialized without a real browser; nothing will be captured"
        );
        (Arc::new(NoopTransport::default()), ObserverMode::Stub)
    }
}

fn detect_chrome_executable() -> Option<PathBuf> {
    if let Ok(raw) = env::var("PAGEWATCH_CHROME") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    for name in chrome_executable_names() {
        if let Ok(path) = which(name) {
            return Some(path);
        }
    }

    let skip_defaults = env::var("PAGEWATCH_SKIP_OS_PATHS")
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);

    if !skip_defaults {
        for candidate in os_specific_chrome_paths() {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

fn chrome_executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome.exe", "chromium.exe", "msedge.exe"]
    }

    #[cfg(any(target_os = "macos", target_os = "linux", target_os = "freebsd"))]
    {
        &[
            "google-chrome-stable",
            "google-chrome",
            "chromium",
            "chromium-browser",
        ]
    }

    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd"
    )))]
    {
        &["chrome"]
    }
}

fn os_specific_chrome_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let mut paths = Vec::new();
        for key in ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"] {
            if let Ok(value) = env::var(key) {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    let root = PathBuf::from(trimmed);
                    paths.push(root.join("Google/Chrome/Application/chrome.exe"));
                    paths.push(root.join("Chromium/Application/chrome.exe"));
                    paths.push(root.join("Microsoft/Edge/Application/msedge.exe"));
                }
            }
        }
        paths
    }

    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    }

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    {
        vec![
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/usr/bin/chromium"),
        ]
    }

    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd"
    )))]
    {
        Vec::new()
    }
}

fn resolve_chrome_path(cfg: &ObserverConfig) -> Option<PathBuf> {
    if !cfg.executable.as_os_str().is_empty() && cfg.executable.exists() {
        return Some(cfg.executable.clone());
    }
    detect_chrome_executable()
}
