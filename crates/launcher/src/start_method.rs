//! Process start methods and the platform capability set

use runtime_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// OS-level mechanism used to create worker processes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StartMethod {
    /// Duplicate the coordinator's memory; workers inherit its global state
    Fork,

    /// Start a fresh process image; global state must be shipped explicitly
    Spawn,
}

impl StartMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartMethod::Fork => "fork",
            StartMethod::Spawn => "spawn",
        }
    }

    /// Returns true if workers see the coordinator's memory at start
    pub fn inherits_parent_state(&self) -> bool {
        matches!(self, StartMethod::Fork)
    }
}

impl fmt::Display for StartMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StartMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fork" => Ok(StartMethod::Fork),
            "spawn" => Ok(StartMethod::Spawn),
            other => Err(Error::InvalidConfig {
                message: format!("Unknown start method '{}', expected 'fork' or 'spawn'", other),
            }),
        }
    }
}

/// Set of start methods a platform supports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartMethodSet {
    methods: Vec<StartMethod>,
}

impl StartMethodSet {
    pub fn new(methods: impl IntoIterator<Item = StartMethod>) -> Self {
        let mut set = Self::default();
        for method in methods {
            if !set.methods.contains(&method) {
                set.methods.push(method);
            }
        }
        set
    }

    /// Start methods available on the current platform
    pub fn platform() -> Self {
        if cfg!(unix) {
            Self::new([StartMethod::Fork, StartMethod::Spawn])
        } else {
            Self::new([StartMethod::Spawn])
        }
    }

    pub fn contains(&self, method: StartMethod) -> bool {
        self.methods.contains(&method)
    }

    pub fn iter(&self) -> impl Iterator<Item = StartMethod> + '_ {
        self.methods.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Fail with a configuration error unless `method` is in the set
    pub fn validate(&self, method: StartMethod) -> Result<()> {
        if self.contains(method) {
            return Ok(());
        }
        let available = self
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        Err(Error::UnsupportedStartMethod {
            method: method.to_string(),
            available: if available.is_empty() {
                "none".to_string()
            } else {
                available
            },
        })
    }
}
