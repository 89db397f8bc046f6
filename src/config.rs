use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::convert::ChromaAddressing;
use crate::session::SessionOptions;
use crate::transport::TransportKind;

const DEFAULT_SOURCE: &str = "synthetic://front_camera";
const DEFAULT_RENDER_FPS: u32 = 30;
const DEFAULT_HEALTH_GRACE_MS: u64 = 2_000;

#[derive(Debug, Deserialize, Default)]
struct IngestConfigFile {
    source: Option<String>,
    transport: Option<String>,
    chroma: Option<String>,
    mirror: Option<String>,
    render: Option<RenderConfigFile>,
    health: Option<HealthConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct RenderConfigFile {
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct HealthConfigFile {
    grace_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub source: String,
    pub transport: TransportKind,
    pub chroma: ChromaAddressing,
    /// Destination the converted frames are re-published to, if any.
    pub mirror: Option<String>,
    pub render_fps: u32,
    pub health_grace: Duration,
}

impl IngestConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SHMFRAME_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: IngestConfigFile) -> Result<Self> {
        let source = file.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string());
        let transport = match file.transport.as_deref() {
            Some(kind) => kind.parse().map_err(|e: String| anyhow!(e))?,
            None => TransportKind::default(),
        };
        let chroma = match file.chroma.as_deref() {
            Some(chroma) => chroma.parse().map_err(|e: String| anyhow!(e))?,
            None => ChromaAddressing::default(),
        };
        let mirror = file.mirror.filter(|mirror| !mirror.trim().is_empty());
        let render_fps = file
            .render
            .and_then(|render| render.fps)
            .unwrap_or(DEFAULT_RENDER_FPS);
        let health_grace = Duration::from_millis(
            file.health
                .and_then(|health| health.grace_ms)
                .unwrap_or(DEFAULT_HEALTH_GRACE_MS),
        );
        Ok(Self {
            source,
            transport,
            chroma,
            mirror,
            render_fps,
            health_grace,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(source) = std::env::var("SHMFRAME_SOURCE") {
            if !source.trim().is_empty() {
                self.source = source;
            }
        }
        if let Ok(kind) = std::env::var("SHMFRAME_TRANSPORT") {
            if !kind.trim().is_empty() {
                self.transport = kind
                    .parse()
                    .map_err(|e: String| anyhow!("SHMFRAME_TRANSPORT: {}", e))?;
            }
        }
        if let Ok(chroma) = std::env::var("SHMFRAME_CHROMA") {
            if !chroma.trim().is_empty() {
                self.chroma = chroma
                    .parse()
                    .map_err(|e: String| anyhow!("SHMFRAME_CHROMA: {}", e))?;
            }
        }
        if let Ok(mirror) = std::env::var("SHMFRAME_MIRROR") {
            self.mirror = Some(mirror).filter(|mirror| !mirror.trim().is_empty());
        }
        if let Ok(fps) = std::env::var("SHMFRAME_RENDER_FPS") {
            self.render_fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("SHMFRAME_RENDER_FPS must be an integer frame rate"))?;
        }
        Ok(())
    }

    /// Normalize and check the settings. Call again after changing fields by hand.
    pub fn validate(&mut self) -> Result<()> {
        self.source = self.source.trim().to_string();
        if self.source.is_empty() {
            return Err(anyhow!("source must not be empty"));
        }
        if self.render_fps == 0 {
            return Err(anyhow!("render fps must be greater than zero"));
        }
        if self.health_grace.is_zero() {
            return Err(anyhow!("health grace must be greater than zero"));
        }
        if let Some(mirror) = &self.mirror {
            let mirror = mirror.trim().to_string();
            self.mirror = (!mirror.is_empty()).then_some(mirror);
        }
        if self.mirror.as_deref() == Some(self.source.as_str()) {
            return Err(anyhow!("mirror destination must differ from the source"));
        }
        Ok(())
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            chroma: self.chroma,
            health_grace: self.health_grace,
        }
    }

    /// Interval between consumer updates at the configured render rate.
    pub fn render_interval(&self) -> Duration {
        (Duration::from_secs(1) / self.render_fps.max(1)).max(Duration::from_micros(1))
    }
}

fn read_config_file(path: &Path) -> Result<IngestConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
