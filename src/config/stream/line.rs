use std::fmt::{self, Display};

#[cfg(feature = "events")]
use chrono::{DateTime, Utc};

/// Identifies where a line of server output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    /// The server's on-disk game log. The canonical stream.
    LogFile,
    Stdout,
    Stderr,
}

/// A single line of server output along with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLine {
    pub line: String,
    pub source: StreamSource,
}

impl StreamLine {
    pub fn new<S: Into<String>>(line: S, source: StreamSource) -> Self {
        Self {
            line: line.into(),
            source,
        }
    }

    pub fn log_file<S: Into<String>>(line: S) -> Self {
        Self::new(line, StreamSource::LogFile)
    }

    pub fn stdout<S: Into<String>>(line: S) -> Self {
        Self::new(line, StreamSource::Stdout)
    }

    pub fn stderr<S: Into<String>>(line: S) -> Self {
        Self::new(line, StreamSource::Stderr)
    }

    pub fn msg(&self) -> &str {
        &self.line
    }

    #[cfg(feature = "events")]
    pub fn extract_timestamp(&self) -> Option<DateTime<Utc>> {
        crate::utils::extract_timestamp(&self.line)
    }
}

impl Display for StreamLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.line)
    }
}
