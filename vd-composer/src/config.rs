// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use anyhow::{bail, Context};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::trace;

use std::path::{Path, PathBuf};

lazy_static! {
    static ref EXTERNAL_DISPLAYS_RE: Regex = Regex::new(r"\A\s*\d+(\s*,\s*\d+)*\s*\z").unwrap();
    static ref DEFAULT_CFG: parsed::Config =
        toml::from_str(include_str!("../../vdcomposer.default.toml")).unwrap();
}

/// Serde representations of the configuration file.
mod parsed {
    use converge::Converge;
    use serde::Deserialize;
    use std::path::PathBuf;

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    #[serde(deny_unknown_fields)]
    pub(super) struct Config {
        #[converge(nest)]
        pub(super) composer: Option<ComposerConfig>,
        #[converge(nest)]
        pub(super) display: Option<DisplaySettings>,
        #[converge(nest)]
        pub(super) drm: Option<DrmConfig>,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    #[serde(deny_unknown_fields)]
    pub(super) struct ComposerConfig {
        pub(super) mode: Option<String>,
        pub(super) display_finder: Option<String>,
        pub(super) external_displays: Option<String>,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    #[serde(deny_unknown_fields)]
    pub(super) struct DisplaySettings {
        pub(super) boot_config_path: Option<PathBuf>,
        pub(super) kmsg_power_events: Option<bool>,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    #[serde(deny_unknown_fields)]
    pub(super) struct DrmConfig {
        pub(super) device_count: Option<u32>,
        pub(super) driver_name: Option<String>,
    }
}

/// Which frame composer drives the displays.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ComposerMode {
    Noop,
    Client,
    Guest,
    /// Served by the client composer.
    Host,
}

impl std::str::FromStr for ComposerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "noop" => Ok(ComposerMode::Noop),
            "client" => Ok(ComposerMode::Client),
            "guest" => Ok(ComposerMode::Guest),
            "host" => Ok(ComposerMode::Host),
            _ => bail!("invalid composer mode: {:?}", s),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DisplayFinderMode {
    Drm,
    Noop,
}

impl std::str::FromStr for DisplayFinderMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drm" => Ok(DisplayFinderMode::Drm),
            "noop" => Ok(DisplayFinderMode::Noop),
            _ => bail!("invalid display finder mode: {:?}", s),
        }
    }
}

/// A display configured outside of DRM.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExternalDisplay {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    pub refresh_rate: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub composer: ComposerConfig,
    pub display: DisplaySettings,
    pub drm: DrmConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComposerConfig {
    pub mode: ComposerMode,
    pub display_finder: DisplayFinderMode,
    pub external_displays: Vec<ExternalDisplay>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplaySettings {
    pub boot_config_path: PathBuf,
    pub kmsg_power_events: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrmConfig {
    pub device_count: u32,
    pub driver_name: String,
}

impl Config {
    pub fn new(path: Option<&PathBuf>) -> anyhow::Result<Config> {
        let file = path
            .map(|p| p.to_owned())
            .or_else(locate_default_config_file);

        let cfg = if let Some(file) = file {
            let content = std::fs::read_to_string(&file)?;
            let parsed: parsed::Config = toml::from_str(&content)
                .context(format!("parsing configuration file {}", file.display()))?;

            Some(parsed)
        } else {
            None
        };

        let mut this = Self::build(cfg)?;
        this.apply_env(|k| std::env::var(k).ok())?;
        this.validate()?;

        Ok(this)
    }

    fn build(cfg: Option<parsed::Config>) -> anyhow::Result<Self> {
        // This is the parsed vdcomposer.default.toml.
        let defaults = DEFAULT_CFG.clone();

        let input = if let Some(cfg) = cfg {
            // Merge the default config with the input config, giving the input
            // precedence.
            use converge::Converge;
            cfg.converge(defaults)
        } else {
            defaults
        };

        // We only unwrap values that should have been set in the default
        // config. This is verified by a test.
        let composer = input.composer.unwrap();
        let display = input.display.unwrap();
        let drm = input.drm.unwrap();

        let this = Config {
            composer: ComposerConfig {
                mode: composer.mode.unwrap().parse()?,
                display_finder: composer.display_finder.unwrap().parse()?,
                external_displays: parse_external_displays(&composer.external_displays.unwrap())?,
            },
            display: DisplaySettings {
                boot_config_path: display.boot_config_path.unwrap(),
                kmsg_power_events: display.kmsg_power_events.unwrap(),
            },
            drm: DrmConfig {
                device_count: drm.device_count.unwrap(),
                driver_name: drm.driver_name.unwrap(),
            },
        };

        trace!("using config: {:#?}", this);

        Ok(this)
    }

    /// Applies overrides from the environment.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(mode) = var("VDCOMPOSER_MODE") {
            self.composer.mode = mode.parse().context("VDCOMPOSER_MODE")?;
        }

        if let Some(finder) = var("VDCOMPOSER_DISPLAY_FINDER") {
            self.composer.display_finder =
                finder.parse().context("VDCOMPOSER_DISPLAY_FINDER")?;
        }

        if let Some(displays) = var("VDCOMPOSER_EXTERNAL_DISPLAYS") {
            self.composer.external_displays =
                parse_external_displays(&displays).context("VDCOMPOSER_EXTERNAL_DISPLAYS")?;
        }

        if let Some(v) = var("VDCOMPOSER_KMSG_POWER_EVENTS") {
            self.display.kmsg_power_events = match v.as_str() {
                "1" | "true" => true,
                "0" | "false" | "" => false,
                _ => bail!("invalid value for VDCOMPOSER_KMSG_POWER_EVENTS: {:?}", v),
            };
        }

        Ok(())
    }

    /// Performs high-level validation on the final configuration.
    fn validate(&self) -> anyhow::Result<()> {
        if self.drm.device_count == 0 {
            bail!("drm.device_count must be positive");
        }

        if self.drm.driver_name.is_empty() {
            bail!("drm.driver_name must not be empty");
        }

        for ext in &self.composer.external_displays {
            if ext.width == 0 || ext.height == 0 || ext.refresh_rate == 0 {
                bail!("invalid external display: {:?}", ext);
            }
        }

        if !self.display.boot_config_path.is_absolute() {
            bail!(
                "boot_config_path must be absolute: {}",
                self.display.boot_config_path.display()
            );
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::build(None).expect("failed to build default config")
    }
}

/// Parses a flat, comma-separated list of `id,width,height,dpi,refresh_hz`
/// groups.
pub fn parse_external_displays(s: &str) -> anyhow::Result<Vec<ExternalDisplay>> {
    if s.trim().is_empty() {
        return Ok(Vec::new());
    }

    if !EXTERNAL_DISPLAYS_RE.is_match(s) {
        bail!("invalid external display list: {:?}", s);
    }

    let parts = s
        .split(',')
        .map(|p| p.trim().parse::<u32>())
        .collect::<Result<Vec<_>, _>>()?;

    if parts.len() % 5 != 0 {
        bail!("external displays must be groups of 5 values, got {}", parts.len());
    }

    Ok(parts
        .chunks_exact(5)
        .map(|c| ExternalDisplay {
            id: c[0],
            width: c[1],
            height: c[2],
            dpi: c[3],
            refresh_rate: c[4],
        })
        .collect())
}

fn locate_default_config_file() -> Option<PathBuf> {
    const BASENAME: &str = "/etc/vdcomposer/vdcomposer.toml";

    let path = Path::new(BASENAME);
    if path.exists() {
        return Some(path.to_owned());
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config_from_str(s: &str) -> anyhow::Result<Config> {
        let input: parsed::Config = toml::from_str(s)?;
        Config::build(Some(input))
    }

    #[test]
    fn test_default() {
        let config = Config::default();
        config.validate().expect("default config is valid");

        assert_eq!(config.composer.mode, ComposerMode::Guest);
        assert_eq!(config.composer.display_finder, DisplayFinderMode::Drm);
        assert!(config.composer.external_displays.is_empty());
        assert_eq!(config.drm.device_count, 10);
        assert_eq!(config.drm.driver_name, "virtio");
        assert!(!config.display.kmsg_power_events);
    }

    #[test]
    fn test_merge() {
        let config = config_from_str(
            r#"
            [composer]
            mode = "client"
            external_displays = "1,1280,720,160,60"
            "#,
        )
        .unwrap();

        config.validate().unwrap();

        let mut expected = Config::default();
        expected.composer.mode = ComposerMode::Client;
        expected.composer.external_displays = vec![ExternalDisplay {
            id: 1,
            width: 1280,
            height: 720,
            dpi: 160,
            refresh_rate: 60,
        }];

        assert_eq!(config, expected);
    }

    #[test]
    fn invalid_mode() {
        let err = config_from_str(
            r#"
            [composer]
            mode = "hardware"
            "#,
        )
        .unwrap_err();

        assert_eq!(err.to_string(), "invalid composer mode: \"hardware\"");
    }

    #[test]
    fn unknown_field() {
        assert!(config_from_str(
            r#"
            [drm]
            device = "/dev/dri/card0"
            "#,
        )
        .is_err());
    }

    #[test]
    fn env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(|k| match k {
                "VDCOMPOSER_MODE" => Some("noop".to_string()),
                "VDCOMPOSER_DISPLAY_FINDER" => Some("noop".to_string()),
                "VDCOMPOSER_EXTERNAL_DISPLAYS" => {
                    Some("1,800,600,120,30, 2,640,480,160,60".to_string())
                }
                "VDCOMPOSER_KMSG_POWER_EVENTS" => Some("1".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.composer.mode, ComposerMode::Noop);
        assert_eq!(config.composer.display_finder, DisplayFinderMode::Noop);
        assert_eq!(config.composer.external_displays.len(), 2);
        assert_eq!(config.composer.external_displays[1].refresh_rate, 60);
        assert!(config.display.kmsg_power_events);

        assert!(config
            .apply_env(|k| (k == "VDCOMPOSER_MODE").then(|| "bogus".to_string()))
            .is_err());
    }

    #[test]
    fn external_display_groups() {
        assert!(parse_external_displays("").unwrap().is_empty());
        assert!(parse_external_displays("1,2,3").is_err());
        assert!(parse_external_displays("1,a,3,4,5").is_err());
        assert_eq!(
            parse_external_displays("3,1920,1080,320,120").unwrap(),
            vec![ExternalDisplay {
                id: 3,
                width: 1920,
                height: 1080,
                dpi: 320,
                refresh_rate: 120,
            }]
        );
    }

    #[test]
    fn relative_boot_config_path() {
        let config = config_from_str(
            r#"
            [display]
            boot_config_path = "state/boot.json"
            "#,
        )
        .unwrap();

        assert!(config.validate().is_err());
    }
}
