use std::fmt::{self, Display};

/// Parsed shape of a game log line:
/// `[2025.08.04-12.34.56:789][  42]LogServer: message`.
pub struct LogMeta {
    pub time: String,
    pub frame: Option<u32>,
    pub msg: String,
}

impl LogMeta {
    pub fn new<S: Into<String>>(line: S) -> Option<Self> {
        let line: String = line.into();
        let line = line.trim();

        if !line.starts_with('[') {
            return None;
        }

        let time_end = line.find(']')?;
        let time = line[1..time_end].to_string();

        let rest = &line[time_end + 1..];
        let (frame, msg) = if let Some(stripped) = rest.strip_prefix('[') {
            let frame_end = stripped.find(']')?;
            let frame = stripped[..frame_end].trim().parse::<u32>().ok();
            (frame, stripped[frame_end + 1..].trim_start().to_string())
        } else {
            (None, rest.trim_start().to_string())
        };

        Some(LogMeta { time, frame, msg })
    }
}

impl Display for LogMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frame {
            Some(frame) => write!(f, "[{}][{}] {}", self.time, frame, self.msg),
            None => write!(f, "[{}] {}", self.time, self.msg),
        }
    }
}
