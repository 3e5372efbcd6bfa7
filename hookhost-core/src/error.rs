// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Host error types

use thiserror::Error;

/// Result type for host operations
pub type HostResult<T> = Result<T, HostError>;

/// Errors surfaced by the host's own fallible APIs.
///
/// Extension failures never show up here; they are recorded on the
/// extension as a [`crate::extension::StageFailure`] instead.
#[derive(Debug, Error)]
pub enum HostError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config parse error: {0}")]
    ConfigParseError(String),

    // Resolver errors
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Host binary version is empty")]
    MissingHostVersion,

    #[error("Invalid search space: {0}")]
    InvalidSearchSpace(String),

    #[error("Resolver task failed: {0}")]
    ResolverTask(String),

    // Registry errors
    #[error("Extension already registered: {0}")]
    DuplicateExtension(String),

    #[error("Extension not found: {0}")]
    ExtensionNotFound(String),

    // Interception errors
    #[error("Interceptor error: {0}")]
    Interceptor(String),

    // IO errors
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for HostError {
    fn from(e: serde_json::Error) -> Self {
        HostError::SerializationError(e.to_string())
    }
}

impl From<toml::de::Error> for HostError {
    fn from(e: toml::de::Error) -> Self {
        HostError::ConfigParseError(e.to_string())
    }
}

/// Error returned from an extension's own callbacks.
///
/// `Outdated` tells the host that the running binary no longer matches what
/// the extension expects; anything else is an ordinary failure.
#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("outdated: {0}")]
    Outdated(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl ExtensionError {
    /// Shorthand for an ordinary failure with a message.
    pub fn msg(message: impl std::fmt::Display) -> Self {
        ExtensionError::Failed(anyhow::anyhow!("{}", message))
    }

    pub fn is_outdated(&self) -> bool {
        matches!(self, ExtensionError::Outdated(_))
    }
}

/// Result type for extension callbacks
pub type ExtensionResult = Result<(), ExtensionError>;
