use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Firmware boot path the written media must support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootMode {
    Bios,
    Uefi,
    Hybrid,
}

impl BootMode {
    pub const ALL: [BootMode; 3] = [BootMode::Bios, BootMode::Uefi, BootMode::Hybrid];

    /// UEFI and hybrid media carry a GPT.
    pub fn uses_gpt(self) -> bool {
        matches!(self, BootMode::Uefi | BootMode::Hybrid)
    }

    /// BIOS firmware jumps into the MBR boot code.
    pub fn boots_from_mbr(self) -> bool {
        matches!(self, BootMode::Bios | BootMode::Hybrid)
    }

    /// The installer volume is copied as a raw NTFS partition rather than extracted.
    pub fn copies_raw_volume(self) -> bool {
        self.uses_gpt()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BootMode::Bios => "bios",
            BootMode::Uefi => "uefi",
            BootMode::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootMode::Bios => write!(f, "BIOS"),
            BootMode::Uefi => write!(f, "UEFI"),
            BootMode::Hybrid => write!(f, "Hybrid"),
        }
    }
}

impl FromStr for BootMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bios" | "legacy" => Ok(BootMode::Bios),
            "uefi" | "efi" => Ok(BootMode::Uefi),
            "hybrid" | "both" => Ok(BootMode::Hybrid),
            other => Err(format!("unknown boot mode '{}' (expected bios, uefi or hybrid)", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases() {
        assert_eq!("BIOS".parse::<BootMode>(), Ok(BootMode::Bios));
        assert_eq!("efi".parse::<BootMode>(), Ok(BootMode::Uefi));
        assert_eq!("both".parse::<BootMode>(), Ok(BootMode::Hybrid));
        assert!("floppy".parse::<BootMode>().is_err());
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&BootMode::Hybrid).unwrap();
        assert_eq!(json, "\"hybrid\"");
        for mode in BootMode::ALL {
            assert_eq!(mode.as_str().parse::<BootMode>(), Ok(mode));
        }
    }
}
