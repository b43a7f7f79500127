// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Power-related types.
//!
//! This module provides the power state of the plug and the data-point index
//! used to address the power switch on the device.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The power state of the plug.
///
/// Serializes as a JSON boolean (`true` for on), which is what both the device
/// and the HTTP API use on the wire.
///
/// # Examples
///
/// ```
/// use plugd::types::PowerState;
///
/// assert_eq!(PowerState::from(true), PowerState::On);
/// assert_eq!(PowerState::Off.as_str(), "off");
/// assert!(PowerState::On.is_on());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "bool", into = "bool")]
pub enum PowerState {
    /// Power is off.
    Off,
    /// Power is on.
    On,
}

impl PowerState {
    /// Returns a lowercase label suitable for logs and CLI verbs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::On => "on",
        }
    }

    /// Returns `true` if the state is [`PowerState::On`].
    #[must_use]
    pub const fn is_on(&self) -> bool {
        matches!(self, Self::On)
    }

    /// Interprets a device data-point value as a power state.
    ///
    /// Devices report the switch as a JSON boolean; anything else is rejected.
    #[must_use]
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        value.as_bool().map(Self::from)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PowerState {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "0" | "false" => Ok(Self::Off),
            "on" | "1" | "true" => Ok(Self::On),
            _ => Err(ConfigError::InvalidValue {
                field: "power state",
                message: format!("expected on/off, got {s:?}"),
            }),
        }
    }
}

impl From<bool> for PowerState {
    fn from(value: bool) -> Self {
        if value { Self::On } else { Self::Off }
    }
}

impl From<PowerState> for bool {
    fn from(state: PowerState) -> Self {
        state.is_on()
    }
}

/// Index of a device data point (DPS).
///
/// Data points are numbered from 1. Single-relay plugs expose their switch on
/// DPS 1, which is the default.
///
/// # Examples
///
/// ```
/// use plugd::types::Dps;
///
/// assert_eq!(Dps::default().value(), 1);
/// assert_eq!(Dps::new(20).unwrap().key(), "20");
/// assert!(Dps::new(0).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dps(u8);

impl Dps {
    /// The data point most plugs use for their main switch.
    pub const POWER: Self = Self(1);

    /// Creates a new data-point index.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if `index` is 0.
    pub fn new(index: u8) -> Result<Self, ConfigError> {
        if index == 0 {
            return Err(ConfigError::InvalidValue {
                field: "dps",
                message: "data point indices start at 1".to_string(),
            });
        }
        Ok(Self(index))
    }

    /// Returns the numeric value of the index.
    #[must_use]
    pub const fn value(&self) -> u8 {
        self.0
    }

    /// Returns the key used for this data point in JSON `dps` maps.
    #[must_use]
    pub fn key(&self) -> String {
        self.0.to_string()
    }
}

impl Default for Dps {
    fn default() -> Self {
        Self::POWER
    }
}

impl fmt::Display for Dps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Dps {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let index = s.trim().parse::<u8>().map_err(|e| ConfigError::InvalidValue {
            field: "dps",
            message: e.to_string(),
        })?;
        Self::new(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_state_from_str() {
        assert_eq!("ON".parse::<PowerState>().unwrap(), PowerState::On);
        assert_eq!("off".parse::<PowerState>().unwrap(), PowerState::Off);
        assert_eq!("1".parse::<PowerState>().unwrap(), PowerState::On);
        assert_eq!("false".parse::<PowerState>().unwrap(), PowerState::Off);
    }

    #[test]
    fn power_state_from_str_invalid() {
        let result = "toggle".parse::<PowerState>();
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { field: "power state", .. }
        ));
    }

    #[test]
    fn power_state_serializes_as_bool() {
        assert_eq!(serde_json::to_string(&PowerState::On).unwrap(), "true");
        assert_eq!(
            serde_json::from_str::<PowerState>("false").unwrap(),
            PowerState::Off
        );
        let unknown: Option<PowerState> = None;
        assert_eq!(serde_json::to_string(&unknown).unwrap(), "null");
    }

    #[test]
    fn power_state_from_value_rejects_non_bool() {
        assert_eq!(
            PowerState::from_value(&serde_json::json!(true)),
            Some(PowerState::On)
        );
        assert_eq!(PowerState::from_value(&serde_json::json!("on")), None);
        assert_eq!(PowerState::from_value(&serde_json::json!(1)), None);
    }

    #[test]
    fn dps_parse_and_display() {
        let dps: Dps = " 20 ".parse().unwrap();
        assert_eq!(dps.value(), 20);
        assert_eq!(dps.to_string(), "20");
        assert!("0".parse::<Dps>().is_err());
        assert!("abc".parse::<Dps>().is_err());
    }
}
