// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device protocol version.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Local protocol version spoken by the device firmware.
///
/// The daemon never interprets the wire protocol itself; the version is passed
/// through to the bridge so it can pick the right framing and encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtocolVersion {
    /// Version 3.1.
    V31,
    /// Version 3.3.
    V33,
    /// Version 3.4.
    #[default]
    V34,
    /// Version 3.5.
    V35,
}

impl ProtocolVersion {
    /// Returns the dotted version string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::V31 => "3.1",
            Self::V33 => "3.3",
            Self::V34 => "3.4",
            Self::V35 => "3.5",
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "3.1" => Ok(Self::V31),
            "3.3" => Ok(Self::V33),
            "3.4" => Ok(Self::V34),
            "3.5" => Ok(Self::V35),
            other => Err(ConfigError::InvalidVersion(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_versions() {
        assert_eq!("3.3".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::V33);
        assert_eq!(" 3.5".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::V35);
        assert_eq!(ProtocolVersion::default().as_str(), "3.4");
    }

    #[test]
    fn rejects_unknown_version() {
        assert_eq!(
            "3.2".parse::<ProtocolVersion>(),
            Err(ConfigError::InvalidVersion("3.2".to_string()))
        );
    }
}
