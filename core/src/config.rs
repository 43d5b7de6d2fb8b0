use crate::boot::BootMode;
use crate::error::{Result, WinstickError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_DRIVER_VARIANT: &str = "ntfs-boot";

/// Inputs a front end hands to a write session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub boot_mode: BootMode,
    pub allow_non_removable: bool,
    pub driver_variant: String,
    /// Sectors per write batch; cancellation is checked between batches.
    pub batch_sectors: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            boot_mode: BootMode::Uefi,
            allow_non_removable: false,
            driver_variant: DEFAULT_DRIVER_VARIANT.to_string(),
            batch_sectors: 2048,
        }
    }
}

impl SessionConfig {
    pub fn new(boot_mode: BootMode) -> Self {
        Self {
            boot_mode,
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        log::debug!("Loaded session config from {}", path.display());
        Self::from_json(&text)
    }

    /// `<config dir>/winstick/config.json`, when the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("winstick").join("config.json"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_sectors == 0 {
            return Err(WinstickError::Other("batch_sectors must be at least 1".to_string()));
        }
        if self.driver_variant.trim().is_empty() {
            return Err(WinstickError::DriverIncompatible(
                "no driver variant configured".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_json_uses_defaults() {
        let config = SessionConfig::from_json(r#"{ "boot_mode": "bios" }"#).unwrap();
        assert_eq!(config.boot_mode, BootMode::Bios);
        assert!(!config.allow_non_removable);
        assert_eq!(config.driver_variant, DEFAULT_DRIVER_VARIANT);
        assert_eq!(config.batch_sectors, 2048);
    }

    #[test]
    fn rejects_zero_batch() {
        let err = SessionConfig::from_json(r#"{ "batch_sectors": 0 }"#).unwrap_err();
        assert!(err.to_string().contains("batch_sectors"));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "boot_mode": "hybrid", "allow_non_removable": true }}"#).unwrap();
        let config = SessionConfig::load(file.path()).unwrap();
        assert_eq!(config.boot_mode, BootMode::Hybrid);
        assert!(config.allow_non_removable);
    }
}
