use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::inference::{SamplingConfig, WindowPolicy};
use crate::tokens::{MAX_FRAME_TOKENS, Symbol, Vocabulary};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Substring an input port name must contain; every port when unset.
    pub input_filter: Option<String>,
    /// Exact output port name; the first port when unset.
    pub output: Option<String>,
    /// Port carrying MIDI clock, excluded from note input.
    pub clock: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub window_limit: usize,
    pub truncation_fraction: f64,
    pub structural_token_retention: bool,
    /// Reported at startup. Controller and pitch-bend input is dropped
    /// whatever this says.
    pub cc_filter: bool,
    pub sampling: SamplingConfig,
    /// Structural symbols placed at position 0 of every fresh context.
    pub header: Vec<String>,
    /// Vocabulary file; the standard layout is generated when unset.
    pub vocabulary: Option<PathBuf>,
    pub ticks_per_grid: u16,
    pub max_grid_steps: u16,
    pub latency_budget_ms: u64,
    pub io_tick_ms: u64,
    pub max_steps_per_run: usize,
    pub lookahead_ticks: u64,
    pub bpm: f64,
    pub ticks_per_quarter: u32,
    pub ring_capacity: usize,
    pub ports: PortConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            window_limit: 512,
            truncation_fraction: 0.5,
            structural_token_retention: true,
            cc_filter: true,
            sampling: SamplingConfig::default(),
            header: Vec::new(),
            vocabulary: None,
            ticks_per_grid: 24,
            max_grid_steps: 16,
            latency_budget_ms: 25,
            io_tick_ms: 1,
            max_steps_per_run: 10,
            lookahead_ticks: 48,
            bpm: 120.0,
            ticks_per_quarter: 48,
            ring_capacity: 1024,
            ports: PortConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let ron_string = fs::read_to_string(path)?;
        let config: RuntimeConfig = ron::from_str(&ron_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let ron_string = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, ron_string)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.truncation_fraction > 0.0 && self.truncation_fraction < 1.0) {
            return Err(Error::Config(format!(
                "truncation_fraction must be in (0, 1), got {}",
                self.truncation_fraction
            )));
        }
        if self.window_limit < self.header.len() + 2 * MAX_FRAME_TOKENS {
            return Err(Error::Config(format!(
                "window_limit {} leaves no room after a {}-token header",
                self.window_limit,
                self.header.len()
            )));
        }
        if !self.sampling.temperature.is_finite() {
            return Err(Error::Config("sampling temperature must be finite".into()));
        }
        if !(self.bpm.is_finite() && self.bpm > 0.0) {
            return Err(Error::Config(format!("bpm must be positive, got {}", self.bpm)));
        }
        if self.ticks_per_grid == 0 || self.ticks_per_quarter == 0 {
            return Err(Error::Config("tick resolutions must be non-zero".into()));
        }
        if self.io_tick_ms == 0 || self.ring_capacity == 0 || self.max_steps_per_run == 0 {
            return Err(Error::Config(
                "io_tick_ms, ring_capacity and max_steps_per_run must be non-zero".into(),
            ));
        }
        if let Some(bad) = self.header.iter().find(|s| !matches!(Symbol::parse(s), Some(Symbol::Structural(_)))) {
            return Err(Error::Config(format!("header symbol '{bad}' is not structural")));
        }
        Ok(())
    }

    pub fn window_policy(&self) -> WindowPolicy {
        WindowPolicy {
            limit: self.window_limit,
            truncation_fraction: self.truncation_fraction,
            retain_structural: self.structural_token_retention,
        }
    }

    pub fn latency_budget(&self) -> Duration {
        Duration::from_millis(self.latency_budget_ms)
    }

    pub fn io_tick(&self) -> Duration {
        Duration::from_millis(self.io_tick_ms)
    }

    pub fn load_vocabulary(&self) -> Result<Vocabulary> {
        match &self.vocabulary {
            Some(path) => Vocabulary::load(path),
            None => {
                let header: Vec<&str> = self.header.iter().map(String::as_str).collect();
                Vocabulary::standard(self.ticks_per_grid, self.max_grid_steps, &header)
            }
        }
    }
}

/// Watches the config file and publishes new sampling parameters whenever
/// it changes. Window settings only take effect at startup.
pub fn watch_sampling(
    path: &Path,
    sampling: Arc<ArcSwap<SamplingConfig>>,
) -> Result<RecommendedWatcher> {
    let path_owned = path.to_path_buf();
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<notify::Event, notify::Error>| match res {
            Ok(event) if event.kind.is_modify() => match RuntimeConfig::load(&path_owned) {
                Ok(config) => {
                    tracing::info!(
                        temperature = config.sampling.temperature,
                        top_k = config.sampling.top_k,
                        "sampling parameters reloaded"
                    );
                    sampling.store(Arc::new(config.sampling));
                }
                Err(e) => tracing::warn!(error = %e, "config reload failed, keeping previous sampling"),
            },
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "config watch error"),
        },
        Config::default(),
    )?;
    watcher.watch(path, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        RuntimeConfig::default().validate().unwrap();
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accompanist.ron");
        let mut config = RuntimeConfig::default();
        config.window_limit = 256;
        config.header = vec!["<genre:jazz>".into()];
        config.sampling.seed = Some(11);
        config.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let config: RuntimeConfig = ron::from_str("(window_limit: 64)").unwrap();
        assert_eq!(config.window_limit, 64);
        assert_eq!(config.truncation_fraction, 0.5);
    }

    #[test]
    fn rejects_out_of_range_fraction() {
        for fraction in [0.0, 1.0, -0.2, f64::NAN] {
            let config = RuntimeConfig {
                truncation_fraction: fraction,
                ..RuntimeConfig::default()
            };
            assert!(config.validate().is_err(), "accepted {fraction}");
        }
    }

    #[test]
    fn rejects_tiny_window_and_bad_header() {
        let config = RuntimeConfig {
            window_limit: 8,
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RuntimeConfig {
            header: vec!["grid:0".into()],
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    fn wait_for(sampling: &ArcSwap<SamplingConfig>, want: impl Fn(&SamplingConfig) -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if want(sampling.load_full().as_ref()) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn sampling_reloads_when_the_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accompanist.ron");
        let mut config = RuntimeConfig::default();
        config.save(&path).unwrap();

        let sampling = Arc::new(ArcSwap::from_pointee(config.sampling.clone()));
        let _watcher = watch_sampling(&path, sampling.clone()).unwrap();

        config.sampling.temperature = 0.3;
        config.sampling.top_k = 7;
        config.save(&path).unwrap();
        assert!(wait_for(&sampling, |s| s.temperature == 0.3 && s.top_k == 7));

        // a file that no longer validates leaves the last good values in place
        let broken = RuntimeConfig {
            truncation_fraction: 2.0,
            sampling: SamplingConfig {
                temperature: 1.5,
                top_k: 3,
                seed: None,
            },
            ..RuntimeConfig::default()
        };
        broken.save(&path).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(sampling.load().temperature, 0.3);
        assert_eq!(sampling.load().top_k, 7);
    }

    #[test]
    fn generated_vocabulary_includes_header() {
        let config = RuntimeConfig {
            header: vec!["<part:keys>".into()],
            ..RuntimeConfig::default()
        };
        let vocab = config.load_vocabulary().unwrap();
        assert!(vocab.token(&Symbol::Structural("<part:keys>".into())).is_some());
        assert_eq!(vocab.ticks_per_grid(), 24);
    }
}
