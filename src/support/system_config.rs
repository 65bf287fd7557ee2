//-
// Copyright (c) 2026, Postern contributors
//
// This file is part of Postern.
//
// Postern is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Postern is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Postern. If not, see <http://www.gnu.org/licenses/>.

use serde::{Deserialize, Serialize};

/// The system-wide configuration for Postern.
///
/// Stored in a TOML file, typically `postern.toml`, named on the command
/// line. Every field has a default so an empty file is a valid
/// configuration.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct SystemConfig {
    /// Configuration for the SMTP session engine.
    #[serde(default)]
    pub smtp: SmtpConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpConfig {
    /// The host name reported in the greeting and the EHLO response.
    pub host_name: String,

    /// The hard cap on message size, in bytes.
    ///
    /// When set, it is advertised as the `SIZE` capability, enforced against
    /// the client's `SIZE=` declaration, and enforced again while the
    /// message data is read. When unset, no limit applies and no `SIZE`
    /// capability is advertised.
    pub max_message_size: Option<u64>,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host_name: "localhost".to_owned(),
            max_message_size: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_config_parses_with_defaults() {
        let config: SystemConfig = toml::from_str("").unwrap();
        assert_eq!("localhost", config.smtp.host_name);
        assert_eq!(None, config.smtp.max_message_size);
    }

    #[test]
    fn smtp_section_parses() {
        let config: SystemConfig = toml::from_str(
            "[smtp]\n\
             host_name = \"mx.example.com\"\n\
             max_message_size = 10485760\n",
        )
        .unwrap();
        assert_eq!("mx.example.com", config.smtp.host_name);
        assert_eq!(Some(10_485_760), config.smtp.max_message_size);
    }
}
