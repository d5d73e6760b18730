//! Code generation settings
//!
//! Every setting that changes generated code is part of the object name, so
//! objects built with different settings never alias in the cache.

use oc_core::config::{CpuConfig, PpuDecoderType, ReservationGranularity};
use serde::{Deserialize, Serialize};

const FMA_BIT: u16 = 1 << 0;
const DCBZ_BIT: u16 = 1 << 1;
const GRANULARITY_SHIFT: u16 = 2;
const PRECISE_BIT: u16 = 1 << 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodegenSettings {
    pub accurate_fma: bool,
    pub accurate_cache_line_stores: bool,
    pub reservation_granularity: ReservationGranularity,
    /// Unknown instructions leave translated code for the precise interpreter
    pub precise_interpreter_fallback: bool,
}

impl CodegenSettings {
    pub fn from_config(config: &CpuConfig) -> Self {
        Self {
            accurate_fma: config.accurate_fma,
            accurate_cache_line_stores: config.accurate_cache_line_stores,
            reservation_granularity: config.reservation_granularity,
            precise_interpreter_fallback: config.ppu_decoder != PpuDecoderType::Recompiler,
        }
    }

    pub fn encode(&self) -> u16 {
        let granularity = match self.reservation_granularity {
            ReservationGranularity::Auto => 0,
            ReservationGranularity::Word => 1,
            ReservationGranularity::Line => 2,
        };
        let mut bits = granularity << GRANULARITY_SHIFT;
        if self.accurate_fma {
            bits |= FMA_BIT;
        }
        if self.accurate_cache_line_stores {
            bits |= DCBZ_BIT;
        }
        if self.precise_interpreter_fallback {
            bits |= PRECISE_BIT;
        }
        bits
    }
}

impl Default for CodegenSettings {
    fn default() -> Self {
        Self::from_config(&CpuConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_encodings_are_distinct() {
        let mut seen = HashSet::new();
        for granularity in [
            ReservationGranularity::Auto,
            ReservationGranularity::Word,
            ReservationGranularity::Line,
        ] {
            for bits in 0..8u8 {
                let settings = CodegenSettings {
                    accurate_fma: bits & 1 != 0,
                    accurate_cache_line_stores: bits & 2 != 0,
                    reservation_granularity: granularity,
                    precise_interpreter_fallback: bits & 4 != 0,
                };
                assert!(seen.insert(settings.encode()), "{:?}", settings);
            }
        }
        assert_eq!(seen.len(), 24);
    }

    #[test]
    fn test_from_config() {
        let settings = CodegenSettings::default();
        assert!(settings.accurate_fma);
        assert!(!settings.precise_interpreter_fallback);
        assert_eq!(settings.encode(), FMA_BIT);
    }
}
