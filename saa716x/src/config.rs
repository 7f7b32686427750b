//! Board configurations.
//!
//! A board wires each tuner adapter to one video input port, and each video
//! port to one FGPI capture engine.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::regs::FGPI_ENGINES;

/// Highest video input port number.
pub const MAX_VIDEO_PORT: u8 = 6;

/// Routing of one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Video input port carrying the adapter's transport stream.
    pub ts_vp: u8,
    /// FGPI engine capturing it.
    pub ts_fgpi: u8,
}

/// Static description of a capture card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardConfig {
    pub model_name: String,
    pub dev_type: String,
    pub adapters: Vec<AdapterConfig>,
}

impl BoardConfig {
    /// TurboSight TBS 6281, dual DVB-T/T2/C.
    pub fn tbs6281() -> Self {
        Self {
            model_name: "TurboSight TBS 6281".to_string(),
            dev_type: "DVB-T/T2/C".to_string(),
            adapters: vec![
                AdapterConfig { ts_vp: 6, ts_fgpi: 1 },
                AdapterConfig { ts_vp: 2, ts_fgpi: 3 },
            ],
        }
    }

    /// TurboSight TBS 6285, quad DVB-T/T2/C.
    pub fn tbs6285() -> Self {
        Self {
            model_name: "TurboSight TBS 6285".to_string(),
            dev_type: "DVB-T/T2/C".to_string(),
            adapters: vec![
                AdapterConfig { ts_vp: 2, ts_fgpi: 3 },
                AdapterConfig { ts_vp: 3, ts_fgpi: 2 },
                AdapterConfig { ts_vp: 6, ts_fgpi: 1 },
                AdapterConfig { ts_vp: 5, ts_fgpi: 0 },
            ],
        }
    }

    /// Look up a preset by short name ("tbs6281", "tbs6285").
    pub fn preset(name: &str) -> Result<Self, ConfigError> {
        match name.to_ascii_lowercase().as_str() {
            "tbs6281" => Ok(Self::tbs6281()),
            "tbs6285" => Ok(Self::tbs6285()),
            _ => Err(ConfigError::UnknownBoard(name.to_string())),
        }
    }

    /// Check adapter count and routing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.adapters.is_empty() || self.adapters.len() > FGPI_ENGINES {
            return Err(ConfigError::AdapterCount(self.adapters.len()));
        }
        for (i, adapter) in self.adapters.iter().enumerate() {
            if adapter.ts_fgpi as usize >= FGPI_ENGINES {
                return Err(ConfigError::FgpiOutOfRange {
                    adapter: i,
                    fgpi: adapter.ts_fgpi,
                });
            }
            if adapter.ts_vp == 0 || adapter.ts_vp > MAX_VIDEO_PORT {
                return Err(ConfigError::VideoPortOutOfRange {
                    adapter: i,
                    vp: adapter.ts_vp,
                });
            }
            if let Some(other) = self.adapters[..i]
                .iter()
                .position(|a| a.ts_fgpi == adapter.ts_fgpi)
            {
                return Err(ConfigError::FgpiInUse {
                    adapter: i,
                    fgpi: adapter.ts_fgpi,
                    other,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        for name in ["tbs6281", "TBS6285"] {
            BoardConfig::preset(name).unwrap().validate().unwrap();
        }
        assert_eq!(BoardConfig::tbs6281().adapters.len(), 2);
        assert_eq!(BoardConfig::tbs6285().adapters[3], AdapterConfig { ts_vp: 5, ts_fgpi: 0 });
        assert!(matches!(
            BoardConfig::preset("tbs6984"),
            Err(ConfigError::UnknownBoard(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_routing() {
        let mut board = BoardConfig::tbs6281();
        board.adapters[1].ts_fgpi = 1;
        assert_eq!(
            board.validate(),
            Err(ConfigError::FgpiInUse { adapter: 1, fgpi: 1, other: 0 })
        );

        let mut board = BoardConfig::tbs6281();
        board.adapters[0].ts_fgpi = 4;
        assert!(matches!(board.validate(), Err(ConfigError::FgpiOutOfRange { .. })));

        let mut board = BoardConfig::tbs6281();
        board.adapters[0].ts_vp = 7;
        assert!(matches!(board.validate(), Err(ConfigError::VideoPortOutOfRange { .. })));

        let mut board = BoardConfig::tbs6281();
        board.adapters.clear();
        assert_eq!(board.validate(), Err(ConfigError::AdapterCount(0)));
    }

    #[test]
    fn test_board_from_toml() {
        let board: BoardConfig = toml::from_str(
            r#"
            model_name = "Custom"
            dev_type = "DVB-C"

            [[adapters]]
            ts_vp = 3
            ts_fgpi = 0
            "#,
        )
        .unwrap();
        assert_eq!(board.adapters, vec![AdapterConfig { ts_vp: 3, ts_fgpi: 0 }]);
        board.validate().unwrap();
    }
}
