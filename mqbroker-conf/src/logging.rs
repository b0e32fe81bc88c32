use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

/// `[log]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Log {
    /// off, file, console or both
    pub to: To,
    pub level: Level,
    pub dir: String,
    /// empty disables the file output even when `to` asks for it
    pub file: String,
}

impl Default for Log {
    fn default() -> Self {
        Log {
            to: To::Console,
            level: Level(slog::Level::Info),
            dir: "/var/log/mqbroker".into(),
            file: "mqbroker.log".into(),
        }
    }
}

impl Log {
    /// `dir` joined with `file`, empty when no file is configured.
    pub fn filename(&self) -> String {
        match (self.dir.trim_end_matches(['/', '\\']), self.file.as_str()) {
            (_, "") => String::new(),
            ("", file) => file.to_owned(),
            (dir, file) => format!("{}/{}", dir, file),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        *self == To::File || *self == To::Both
    }

    #[inline]
    pub fn console(&self) -> bool {
        *self == To::Console || *self == To::Both
    }

    #[inline]
    pub fn off(&self) -> bool {
        *self == To::Off
    }
}

impl FromStr for To {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "off" => To::Off,
            "file" => To::File,
            "console" => To::Console,
            "both" => To::Both,
            _ => return Err(format!("unknown log output {:?}, expected off, file, console or both", s)),
        })
    }
}

/// Minimum level that gets written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level(slog::Level);

impl Level {
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.0
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        slog::Level::from_str(s).map(Level).map_err(|_| format!("invalid log level: {:?}", s))
    }
}

fn from_str_de<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr<Err = String>,
{
    String::deserialize(deserializer)?.parse().map_err(de::Error::custom)
}

impl<'de> Deserialize<'de> for To {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        from_str_de(deserializer)
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        from_str_de(deserializer)
    }
}
