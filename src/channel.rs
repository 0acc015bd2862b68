//! Release channels and their acceptance policy

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::version::Version;

/// A release track
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Stable,
    Beta,
    Alpha,
    Nightly,
}

impl Default for Channel {
    fn default() -> Self {
        Channel::Stable
    }
}

impl Channel {
    /// Path segment used in the manifest URL
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Stable => "stable",
            Channel::Beta => "beta",
            Channel::Alpha => "alpha",
            Channel::Nightly => "nightly",
        }
    }

    /// Release track a version belongs to, judged by its pre-release tag
    pub fn of_version(version: &Version) -> Channel {
        match version.prerelease_tag().as_deref() {
            None => Channel::Stable,
            Some("beta") | Some("rc") => Channel::Beta,
            Some("alpha") => Channel::Alpha,
            Some(_) => Channel::Nightly,
        }
    }

    /// Whether a subscriber of this channel may receive `version`
    pub fn accepts(&self, version: &Version) -> bool {
        Channel::of_version(version) <= *self
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stable" => Ok(Channel::Stable),
            "beta" => Ok(Channel::Beta),
            "alpha" => Ok(Channel::Alpha),
            "nightly" => Ok(Channel::Nightly),
            _ => Err(format!("Unknown channel: {}", s)),
        }
    }
}
