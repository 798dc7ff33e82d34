use crate::config::stream::{InternalEvent, LogMeta};

const ADVERTISING_MARKER: &str = "has successfully started and is now advertising for join";
const CLOSING_MARKER: &str = "Closing by request";

impl LogMeta {
    pub fn parse_event(&self) -> Option<InternalEvent> {
        scan_message(&self.msg)
    }
}

/// Recognizes lifecycle markers in a raw log line. Lines that do not parse
/// as structured log output are still scanned whole.
pub fn scan_line(line: &str) -> Option<InternalEvent> {
    match LogMeta::new(line) {
        Some(meta) => meta.parse_event(),
        None => scan_message(line),
    }
}

fn scan_message(msg: &str) -> Option<InternalEvent> {
    if msg.contains(ADVERTISING_MARKER) {
        return Some(InternalEvent::ServerAdvertising);
    }
    if msg.contains(CLOSING_MARKER) {
        return Some(InternalEvent::ServerClosing);
    }
    None
}
