//! Connectivity and power signals.

use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};

/// Kind of network link reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Wifi,
    Ethernet,
    Cellular,
    /// The host does not report a link type.
    #[default]
    Unknown,
}

impl ConnectionType {
    /// Whether a Wi-Fi-only policy allows syncing on this link.
    ///
    /// An unknown link counts as allowed so missing information never blocks
    /// sync indefinitely.
    pub fn satisfies_wifi_only(&self) -> bool {
        !matches!(self, Self::Cellular)
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wifi => write!(f, "wifi"),
            Self::Ethernet => write!(f, "ethernet"),
            Self::Cellular => write!(f, "cellular"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for ConnectionType {
    type Err = ParseError;

    fn from_str(s: &str) -> ParseResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "wifi" | "wi-fi" => Ok(Self::Wifi),
            "ethernet" => Ok(Self::Ethernet),
            "cellular" | "4g" | "5g" => Ok(Self::Cellular),
            "unknown" => Ok(Self::Unknown),
            _ => Err(ParseError::unknown("connection type", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryInfo {
    /// Charge percentage, 0-100.
    pub level: u8,
    pub charging: bool,
}

impl BatteryInfo {
    pub fn new(level: u8, charging: bool) -> Self {
        Self {
            level: level.min(100),
            charging,
        }
    }
}

/// Point-in-time view of connectivity and power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub online: bool,
    pub connection_type: ConnectionType,
    pub battery: Option<BatteryInfo>,
}

impl NetworkSnapshot {
    pub fn online() -> Self {
        Self {
            online: true,
            connection_type: ConnectionType::Unknown,
            battery: None,
        }
    }

    pub fn offline() -> Self {
        Self {
            online: false,
            ..Self::online()
        }
    }
}

impl Default for NetworkSnapshot {
    fn default() -> Self {
        Self::online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wifi_only_policy() {
        assert!(ConnectionType::Wifi.satisfies_wifi_only());
        assert!(ConnectionType::Ethernet.satisfies_wifi_only());
        assert!(ConnectionType::Unknown.satisfies_wifi_only());
        assert!(!ConnectionType::Cellular.satisfies_wifi_only());
    }

    #[test]
    fn test_battery_level_clamped() {
        assert_eq!(BatteryInfo::new(150, false).level, 100);
    }

    #[test]
    fn test_parse_connection_type() {
        assert_eq!("Wi-Fi".parse::<ConnectionType>().unwrap(), ConnectionType::Wifi);
        assert_eq!("5g".parse::<ConnectionType>().unwrap(), ConnectionType::Cellular);
        assert!("carrier-pigeon".parse::<ConnectionType>().is_err());
    }
}
