//! Console output and pipeline events
//!
//! Pipeline components never print. They report [`FetchEvent`]s to an injected
//! [`EventObserver`]; the [`Logger`] is the observer used by the command line,
//! [`RecordingObserver`] is the one tests assert against.

use crate::squash::SquashState;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A state transition or notable step in one fetch-and-squash invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    ReferenceParsed {
        canonical: String,
        familiar: String,
        tag: String,
    },
    EndpointsResolved {
        registry: String,
        trust: String,
    },
    /// Every candidate transport ended unauthorized
    AuthExhausted {
        url: String,
    },
    TrustedDigest {
        digest: String,
    },
    ManifestExists {
        registry: String,
        digest: String,
        tag: String,
    },
    LayerSkipped {
        index: usize,
        media_type: String,
    },
    LayerDownloading {
        index: usize,
        total: usize,
    },
    LayerFetched {
        index: usize,
        digest: String,
        length: u64,
        media_type: String,
    },
    Squash(SquashState),
}

pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &FetchEvent);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl EventObserver for NullObserver {
    fn on_event(&self, _event: &FetchEvent) {}
}

/// Keeps every event in arrival order
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<FetchEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FetchEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn squash_states(&self) -> Vec<SquashState> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                FetchEvent::Squash(state) => Some(state),
                _ => None,
            })
            .collect()
    }
}

impl EventObserver for RecordingObserver {
    fn on_event(&self, event: &FetchEvent) {
        match self.events.lock() {
            Ok(mut guard) => guard.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}

/// Logger responsible for all user-visible output
#[derive(Debug, Clone)]
pub struct Logger {
    pub verbose: bool,
    pub quiet: bool,
    pub start_time: Option<Instant>,
}

impl Logger {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            quiet: false,
            start_time: Some(Instant::now()),
        }
    }

    pub fn new_quiet() -> Self {
        Self {
            verbose: false,
            quiet: true,
            start_time: Some(Instant::now()),
        }
    }

    /// Main section heading
    pub fn section(&self, title: &str) {
        if !self.quiet {
            println!("\n=== {} ===", title);
        }
    }

    pub fn debug(&self, message: &str) {
        if self.verbose && !self.quiet {
            println!("🐛 DEBUG: {}", message);
        }
    }

    /// Information message
    pub fn info(&self, message: &str) {
        if !self.quiet {
            println!("ℹ️  {}", message);
        }
    }

    /// Success message
    pub fn success(&self, message: &str) {
        if !self.quiet {
            println!("✅ {}", message);
        }
    }

    /// Error message, printed even in quiet mode
    pub fn error(&self, message: &str) {
        eprintln!("❌ ERROR: {}", message);
    }

    /// Step information
    pub fn step(&self, message: &str) {
        if !self.quiet {
            println!("▶️  {}", message);
        }
    }

    /// Detailed information (only shown in verbose mode)
    pub fn detail(&self, message: &str) {
        if self.verbose && !self.quiet {
            println!("   {}", message);
        }
    }

    /// Format file size in human-readable units
    pub fn format_size(&self, bytes: u64) -> String {
        if bytes < 1024 {
            format!("{} B", bytes)
        } else if bytes < 1024 * 1024 {
            format!("{:.1} KB", bytes as f64 / 1024.0)
        } else if bytes < 1024 * 1024 * 1024 {
            format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
        } else {
            format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
        }
    }

    /// Format duration in human-readable format
    pub fn format_duration(&self, duration: Duration) -> String {
        let secs = duration.as_secs();
        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m{}s", secs / 60, secs % 60)
        } else {
            format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.map(|t| t.elapsed()).unwrap_or_default()
    }
}

impl EventObserver for Logger {
    fn on_event(&self, event: &FetchEvent) {
        match event {
            FetchEvent::ReferenceParsed {
                canonical,
                familiar,
                tag,
            } => self.debug(&format!(
                "parsed image reference: canonical={} familiar={} tag={}",
                canonical, familiar, tag
            )),
            FetchEvent::EndpointsResolved { registry, trust } => self.debug(&format!(
                "got remote endpoints: registry={} trust={}",
                registry, trust
            )),
            FetchEvent::AuthExhausted { url } => {
                self.debug(&format!("authentication failed for {}", url))
            }
            FetchEvent::TrustedDigest { digest } => {
                self.detail(&format!("Trusted digest for tag: {}", digest))
            }
            FetchEvent::ManifestExists {
                registry,
                digest,
                tag,
            } => self.detail(&format!(
                "Manifest {} ({}) exists on {}",
                digest, tag, registry
            )),
            FetchEvent::LayerSkipped { index, media_type } => self.debug(&format!(
                "skipping descriptor {} with media type {}",
                index + 1,
                media_type
            )),
            FetchEvent::LayerDownloading { index, total } => {
                self.step(&format!("Downloading layer {}/{}", index + 1, total))
            }
            FetchEvent::LayerFetched {
                index,
                digest,
                length,
                media_type,
            } => self.detail(&format!(
                "Layer {}: {} ({}, {})",
                index + 1,
                digest,
                self.format_size(*length),
                media_type
            )),
            FetchEvent::Squash(state) => match state {
                SquashState::Validating => self.debug("validating squash input"),
                SquashState::Extracting { layer, total } => {
                    self.step(&format!("Untarring layer {}/{}", layer, total))
                }
                SquashState::Packaging => self.step("Packaging merged rootfs"),
                SquashState::Done => self.debug("squash complete"),
                SquashState::Failed => self.debug("squash failed"),
            },
        }
    }
}
