use serde::{Deserialize, Serialize};

/// The per unit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
    /// Whether to free the full parameters right after the unit's forward.
    ///
    /// Ignored for the root unit, whose parameters are needed again as soon as the
    /// backward pass starts.
    pub reshard_after_forward: bool,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            reshard_after_forward: true,
        }
    }
}

impl UnitConfig {
    pub fn new(reshard_after_forward: bool) -> Self {
        Self {
            reshard_after_forward,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: UnitConfig = serde_json::from_str("{}").unwrap();
        assert!(config.reshard_after_forward);

        let config: UnitConfig =
            serde_json::from_str(r#"{ "reshard_after_forward": false }"#).unwrap();
        assert_eq!(config, UnitConfig::new(false));
    }
}
