//! Server configuration.
//!
//! Settings come from an INI-style text file (`[Server]` section). Required
//! keys: `Port`, `ListenAddr`, `SessionName`, `AppGUID`. Optional keys:
//! `MaxPlayers` (default 10), `IdMask` (hex, default 0), `ClientPort`
//! (the well-known client-side port; defaults to `Port`). Missing or
//! malformed required values are fatal at startup.

use log::warn;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;

const SECTION: &str = "Server";

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    MissingKey(&'static str),
    InvalidValue { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config file: {}", e),
            Self::MissingKey(key) => write!(f, "missing config key [{}] {}", SECTION, key),
            Self::InvalidValue { key, value } => {
                write!(f, "invalid value for [{}] {}: {:?}", SECTION, key, value)
            }
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// A parsed INI-style key/value file: named sections of key/value pairs.
///
/// Accepts `;` and `//` comments, quoted values, and trailing comments after
/// unquoted values. Duplicate keys and pairs outside a section are warned
/// about and ignored.
pub struct IniFile {
    sections: HashMap<String, HashMap<String, String>>,
}

impl IniFile {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    pub fn parse(text: &str) -> Self {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current: Option<String> = None;

        let is_comment = |s: &str| s.starts_with(';') || s.starts_with("//");

        for line in text.lines() {
            let line = line.trim_start();
            if line.is_empty() || is_comment(line) {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let Some(end) = rest.find(']') else {
                    warn!("bad section name: {}", line);
                    current = None;
                    continue;
                };
                let name = &rest[..end];

                let tail = rest[end + 1..].trim_start();
                if !tail.is_empty() && !is_comment(tail) {
                    warn!("unexpected text after section name {:?}: {}", name, tail);
                }

                sections.entry(name.to_string()).or_default();
                current = Some(name.to_string());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                warn!("bad key/value pair: {}", line);
                continue;
            };
            let key = key.trim_end();
            let mut value = value.trim_start();

            if let Some(quote) = value.chars().next().filter(|c| *c == '"' || *c == '\'') {
                let inner = &value[1..];
                let Some(end) = inner.find(quote) else {
                    warn!("bad string value for {:?}: {}", key, value);
                    continue;
                };

                let tail = inner[end + 1..].trim_start();
                if !tail.is_empty() && !is_comment(tail) {
                    warn!("unexpected text after string value for {:?}: {}", key, tail);
                }

                value = &inner[..end];
            } else {
                // Strip trailing comments from unquoted values.
                for (i, _) in value.char_indices() {
                    if is_comment(&value[i..]) {
                        value = &value[..i];
                        break;
                    }
                }
                value = value.trim_end();
            }

            let Some(section) = &current else {
                warn!("ignoring {:?} outside of valid section", key);
                continue;
            };

            let entries = sections.entry(section.clone()).or_default();
            if entries.contains_key(key) {
                warn!("ignoring duplicate key {:?} in section {:?}", key, section);
                continue;
            }
            entries.insert(key.to_string(), value.to_string());
        }

        Self { sections }
    }

    pub fn value(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(String::as_str)
    }
}

/// Parses a 36-character hyphenated hex GUID (8-4-4-4-12) into its 16 bytes.
pub fn parse_guid(text: &str) -> Option<[u8; 16]> {
    let bytes = text.as_bytes();
    if bytes.len() != 36 {
        return None;
    }

    let mut out = [0u8; 16];
    let mut index = 0;
    let mut i = 0;
    while i < 36 {
        if matches!(i, 8 | 13 | 18 | 23) {
            if bytes[i] != b'-' {
                return None;
            }
            i += 1;
            continue;
        }
        let high = (bytes[i] as char).to_digit(16)? as u8;
        let low = (bytes[i + 1] as char).to_digit(16)? as u8;
        out[index] = high << 4 | low;
        index += 1;
        i += 2;
    }

    Some(out)
}

/// Immutable server settings, consumed once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub port: u16,
    pub session_name: String,
    pub application_guid: [u8; 16],
    pub max_players: u32,
    pub id_mask: u32,
    /// Port clients listen on for the host's outbound TCP connection, also
    /// the destination port for per-client UDP.
    pub client_port: u16,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ini = IniFile::load(path).map_err(ConfigError::Io)?;
        Self::from_ini(&ini)
    }

    pub fn from_ini(ini: &IniFile) -> Result<Self, ConfigError> {
        let required = |key: &'static str| {
            ini.value(SECTION, key).ok_or(ConfigError::MissingKey(key))
        };
        let invalid = |key: &'static str, value: &str| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        };

        let port_text = required("Port")?;
        let port: u16 = port_text.parse().map_err(|_| invalid("Port", port_text))?;

        let listen_addr = required("ListenAddr")?.to_string();
        let session_name = required("SessionName")?.to_string();

        let guid_text = required("AppGUID")?;
        let application_guid = parse_guid(guid_text).ok_or_else(|| invalid("AppGUID", guid_text))?;

        let max_players = match ini.value(SECTION, "MaxPlayers") {
            Some(text) => text.parse().map_err(|_| invalid("MaxPlayers", text))?,
            None => 10,
        };

        let id_mask = match ini.value(SECTION, "IdMask") {
            Some(text) => {
                let digits = text.strip_prefix("0x").unwrap_or(text);
                u32::from_str_radix(digits, 16).map_err(|_| invalid("IdMask", text))?
            }
            None => 0,
        };

        let client_port = match ini.value(SECTION, "ClientPort") {
            Some(text) => text.parse().map_err(|_| invalid("ClientPort", text))?,
            None => port,
        };

        Ok(Self {
            listen_addr,
            port,
            session_name,
            application_guid,
            max_players,
            id_mask,
            client_port,
        })
    }
}
