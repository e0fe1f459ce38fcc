// Fingerprint Collector
//
// Computes a one-time device/browser fingerprint at session start:
// canvas/WebGL/audio hashes, hardware attributes, screen geometry, and
// locale/timezone, composed into a derived device id used downstream for
// duplicate-respondent detection.
//
// Every sub-signal degrades gracefully: a probe that fails or is
// unsupported yields an absent field, never an error. A fingerprint with
// all fields absent is still valid; it simply carries no device id and
// contributes nothing to duplicate detection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;

/// Screen geometry reported by the client
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenInfo {
    pub width: u32,
    pub height: u32,
    pub color_depth: u8,
    pub pixel_ratio: f32,
}

/// Device identity signal, computed once per session and immutable after.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Canvas rendering hash
    pub canvas_fingerprint: Option<String>,
    /// WebGL renderer/vendor hash
    pub webgl_fingerprint: Option<String>,
    /// Audio context fingerprint
    pub audio_fingerprint: Option<String>,
    /// Device memory in GB
    pub device_memory: Option<f32>,
    /// Logical CPU core count
    pub hardware_concurrency: Option<u8>,
    /// Screen geometry
    pub screen: Option<ScreenInfo>,
    /// Timezone offset in minutes from UTC
    pub timezone_offset: Option<i32>,
    /// Preferred language tag
    pub language: Option<String>,
    /// Platform string
    pub platform: Option<String>,
    /// Composite device hash derived from the present fields.
    /// Absent when no identifying sub-signal was collected.
    pub device_id: Option<String>,
}

impl Fingerprint {
    /// Whether any identifying sub-signal was collected.
    pub fn has_identity(&self) -> bool {
        self.device_id.is_some()
    }

    /// Derive the composite device id from whichever fields are present.
    fn derive_device_id(&mut self) {
        let mut parts: Vec<String> = Vec::new();
        if let Some(v) = &self.canvas_fingerprint {
            parts.push(format!("c:{}", v));
        }
        if let Some(v) = &self.webgl_fingerprint {
            parts.push(format!("w:{}", v));
        }
        if let Some(v) = &self.audio_fingerprint {
            parts.push(format!("a:{}", v));
        }
        if let Some(v) = self.device_memory {
            parts.push(format!("m:{}", v));
        }
        if let Some(v) = self.hardware_concurrency {
            parts.push(format!("h:{}", v));
        }
        if let Some(s) = &self.screen {
            parts.push(format!(
                "s:{}x{}x{}@{}",
                s.width, s.height, s.color_depth, s.pixel_ratio
            ));
        }
        if let Some(v) = self.timezone_offset {
            parts.push(format!("t:{}", v));
        }
        if let Some(v) = &self.language {
            parts.push(format!("l:{}", v));
        }
        if let Some(v) = &self.platform {
            parts.push(format!("p:{}", v));
        }

        if parts.is_empty() {
            self.device_id = None;
        } else {
            let hash = Sha256::digest(parts.join("|").as_bytes());
            self.device_id = Some(hex::encode(&hash[..16]));
        }
    }
}

/// Source of the individual fingerprint sub-signals.
///
/// Each probe is asynchronous (querying runtime capabilities may itself be
/// async in the embedding environment) and returns `None` when the signal
/// is unavailable.
#[async_trait]
pub trait SignalProbe: Send + Sync {
    async fn canvas_hash(&self) -> Option<String>;
    async fn webgl_hash(&self) -> Option<String>;
    async fn audio_hash(&self) -> Option<String>;
    async fn device_memory(&self) -> Option<f32>;
    async fn hardware_concurrency(&self) -> Option<u8>;
    async fn screen(&self) -> Option<ScreenInfo>;
    async fn timezone_offset(&self) -> Option<i32>;
    async fn language(&self) -> Option<String>;
    async fn platform(&self) -> Option<String>;
}

/// One-shot fingerprint collector.
///
/// `generate` is idempotent within a session: the first call assembles the
/// fingerprint from the probe, later calls return the cached value without
/// re-probing.
#[derive(Default)]
pub struct FingerprintCollector {
    cached: OnceCell<Fingerprint>,
}

impl FingerprintCollector {
    pub fn new() -> Self {
        Self {
            cached: OnceCell::new(),
        }
    }

    /// Assemble the fingerprint, or return the cached one.
    pub async fn generate(&self, probe: &dyn SignalProbe) -> Fingerprint {
        self.cached
            .get_or_init(|| async {
                let mut fp = Fingerprint {
                    canvas_fingerprint: probe.canvas_hash().await,
                    webgl_fingerprint: probe.webgl_hash().await,
                    audio_fingerprint: probe.audio_hash().await,
                    device_memory: probe.device_memory().await,
                    hardware_concurrency: probe.hardware_concurrency().await,
                    screen: probe.screen().await,
                    timezone_offset: probe.timezone_offset().await,
                    language: probe.language().await,
                    platform: probe.platform().await,
                    device_id: None,
                };
                fp.derive_device_id();
                fp
            })
            .await
            .clone()
    }
}
