use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing_subscriber::filter::{Directive, LevelFilter};

/// Global log level, e.g. `info`.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLevel(pub LevelFilter);

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel(LevelFilter::INFO)
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level = s
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid log level: {s}"))?;
        Ok(Self(level))
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<LogLevel> for Directive {
    fn from(val: LogLevel) -> Self {
        val.0.into()
    }
}

/// Log level for a single module, e.g. `ds_reconciler=debug`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleLevel(pub Directive);

impl FromStr for ModuleLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.contains('=') {
            return Err(anyhow::anyhow!("module level needs a module name: {s}"));
        }
        let directive = s
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid module level: {s}"))?;
        Ok(Self(directive))
    }
}

impl Display for ModuleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ModuleLevel> for Directive {
    fn from(val: ModuleLevel) -> Self {
        val.0
    }
}

macro_rules! serde_via_str {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_str(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

serde_via_str!(LogLevel);
serde_via_str!(ModuleLevel);
