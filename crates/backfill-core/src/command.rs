//! Success-flag results for remote control commands.
//!
//! Every start/scale/stop/create call reports through a [`CommandResult`];
//! callers inspect `success` explicitly or convert with
//! [`CommandResult::into_result`] (unit commands) or
//! [`CommandResult::into_value`] to fail fast.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Future resolving to a [`CommandResult`].
pub type CommandFuture<'a, T = ()> = Pin<Box<dyn Future<Output = CommandResult<T>> + Send + 'a>>;

/// Outcome of a control command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult<T = ()> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> CommandResult<T> {
    #[must_use]
    pub fn ok(value: T) -> Self {
        Self {
            success: true,
            value: Some(value),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: impl fmt::Display) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(error.to_string()),
        }
    }

    /// Fold a library result into a command outcome.
    #[must_use]
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(err) => Self::failed(err),
        }
    }

    /// Convert into the carried value, naming `command` in the failure.
    ///
    /// A successful result must carry its value; unit commands use
    /// [`CommandResult::into_result`], which only reads `success`.
    pub fn into_value(self, command: &str) -> Result<T> {
        if !self.success {
            return Err(failure(command, self.error));
        }
        self.value.ok_or_else(|| Error::CommandFailed {
            command: command.to_string(),
            message: "reported success without a value".to_string(),
        })
    }
}

fn failure(command: &str, error: Option<String>) -> Error {
    Error::CommandFailed {
        command: command.to_string(),
        message: error.unwrap_or_else(|| "unknown error".to_string()),
    }
}

impl CommandResult<()> {
    #[must_use]
    pub fn done() -> Self {
        Self::ok(())
    }

    /// Convert into a `Result`, naming `command` in the failure.
    ///
    /// `success` is the only signal; a unit value serializes as `null` and
    /// reads back as absent.
    pub fn into_result(self, command: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            Err(failure(command, self.error))
        }
    }
}
