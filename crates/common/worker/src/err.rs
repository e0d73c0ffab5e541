// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{error::Error, fmt};

pub type WorkResult<T = ()> = std::result::Result<T, WorkError>;

type BoxedSource = Box<dyn Error + Send + Sync>;

/// How the manager reacts to a failed hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Logged; the worker runs again on its next trigger.
    Transient,
    /// The worker stops.
    Fatal,
}

/// Error returned from [`Worker`](crate::Worker) hooks.
#[derive(Debug)]
pub struct WorkError {
    severity: ErrorSeverity,
    message:  String,
    source:   Option<BoxedSource>,
}

impl WorkError {
    pub fn transient(message: impl Into<String>) -> Self { Self::new(ErrorSeverity::Transient, message, None) }

    pub fn fatal(message: impl Into<String>) -> Self { Self::new(ErrorSeverity::Fatal, message, None) }

    pub fn transient_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::new(ErrorSeverity::Transient, message, Some(Box::new(source)))
    }

    pub fn fatal_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::new(ErrorSeverity::Fatal, message, Some(Box::new(source)))
    }

    fn new(severity: ErrorSeverity, message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self {
            severity,
            message: message.into(),
            source,
        }
    }

    #[must_use]
    pub const fn severity(&self) -> ErrorSeverity { self.severity }

    #[must_use]
    pub fn is_fatal(&self) -> bool { self.severity == ErrorSeverity::Fatal }

    #[must_use]
    pub fn is_transient(&self) -> bool { self.severity == ErrorSeverity::Transient }

    #[must_use]
    pub fn message(&self) -> &str { &self.message }
}

impl fmt::Display for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.severity {
            ErrorSeverity::Transient => write!(f, "transient worker error: {}", self.message)?,
            ErrorSeverity::Fatal => write!(f, "fatal worker error: {}", self.message)?,
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl Error for WorkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_deref().map(|source| source as &(dyn Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_source() {
        let io = std::io::Error::other("disk gone");
        let err = WorkError::fatal_with_source("flush failed", io);
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "fatal worker error: flush failed: disk gone");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_transient_without_source() {
        let err = WorkError::transient("retry later");
        assert_eq!(err.severity(), ErrorSeverity::Transient);
        assert!(err.source().is_none());
        assert_eq!(err.message(), "retry later");
    }
}
