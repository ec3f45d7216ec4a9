// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use tracing::{debug, warn};

use crate::{
    config::{ComposerConfig, DisplayFinderMode},
    display::DisplayConfig,
    drm::DrmClient,
    vsync,
};

/// A display to create at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayDescription {
    pub id: u64,
    pub active_config: i32,
    pub configs: Vec<DisplayConfig>,
}

impl DisplayDescription {
    fn single(id: u32, width: u32, height: u32, dpi_x: u32, dpi_y: u32, refresh_hz: u32) -> Self {
        let config = DisplayConfig::new(
            id as i32,
            width as i32,
            height as i32,
            dpi_x as i32,
            dpi_y as i32,
            vsync::period_from_hz(refresh_hz),
        );

        let mut configs = vec![config];
        DisplayConfig::assign_groups(&mut configs);
        Self {
            id: id as u64,
            active_config: config.id,
            configs,
        }
    }
}

fn noop_displays() -> Vec<DisplayDescription> {
    vec![DisplayDescription::single(0, 1920, 1080, 160, 160, 60)]
}

/// Lists the displays to create: connected DRM displays (or one fixed
/// display), followed by any configured external displays.
pub fn find_displays(cfg: &ComposerConfig, drm: Option<&DrmClient>) -> Vec<DisplayDescription> {
    let mut displays = match (cfg.display_finder, drm) {
        (DisplayFinderMode::Drm, Some(drm)) => drm
            .display_configs()
            .into_iter()
            .map(|c| {
                DisplayDescription::single(c.id, c.width, c.height, c.dpi_x, c.dpi_y, c.refresh_rate)
            })
            .collect(),
        (DisplayFinderMode::Drm, None) => {
            warn!("no DRM device to find displays with, using a fixed display");
            noop_displays()
        }
        (DisplayFinderMode::Noop, _) => noop_displays(),
    };

    for ext in &cfg.external_displays {
        if displays.iter().any(|d| d.id == ext.id as u64) {
            warn!(display_id = ext.id, "ignoring external display with duplicate id");
            continue;
        }

        displays.push(DisplayDescription::single(
            ext.id,
            ext.width,
            ext.height,
            ext.dpi,
            ext.dpi,
            ext.refresh_rate,
        ));
    }

    debug!(?displays, "found displays");
    displays
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::ExternalDisplay,
        drm::fake::{FakeConnector, FakeKms},
    };
    use pretty_assertions::assert_eq;

    fn cfg(finder: DisplayFinderMode, external_displays: Vec<ExternalDisplay>) -> ComposerConfig {
        ComposerConfig {
            mode: crate::config::ComposerMode::Guest,
            display_finder: finder,
            external_displays,
        }
    }

    #[test_log::test]
    fn noop() {
        let displays = find_displays(&cfg(DisplayFinderMode::Noop, vec![]), None);
        assert_eq!(
            displays,
            vec![DisplayDescription {
                id: 0,
                active_config: 0,
                configs: vec![DisplayConfig::new(0, 1920, 1080, 160, 160, 16_666_666)],
            }]
        );
    }

    #[test_log::test]
    fn drm_and_external() {
        let kms = Arc::new(FakeKms::new(vec![
            FakeConnector::new(1280, 720, 60),
            FakeConnector::new(800, 600, 30),
        ]));
        kms.set_connected(1, false);
        let drm = DrmClient::new(kms).unwrap();

        let external = vec![
            ExternalDisplay {
                id: 0,
                width: 640,
                height: 480,
                dpi: 120,
                refresh_rate: 60,
            },
            ExternalDisplay {
                id: 2,
                width: 640,
                height: 480,
                dpi: 120,
                refresh_rate: 30,
            },
        ];

        let displays = find_displays(&cfg(DisplayFinderMode::Drm, external), Some(&drm));
        let summary: Vec<_> = displays
            .iter()
            .map(|d| (d.id, d.configs[0].width, d.configs[0].vsync_period))
            .collect();
        assert_eq!(summary, vec![(0, 1280, 16_666_666), (2, 640, 33_333_333)]);
        assert_eq!(displays[1].configs[0].dpi_x, 120);
    }
}
