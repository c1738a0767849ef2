//! Output formatters for scan results.
//!
//! One line per fetched path, pretty or JSON.

use crate::scanner::ScanRecord;

/// Human-readable result line.
pub fn format_pretty(record: &ScanRecord) -> String {
    format!(
        "{} {} ({}) {}: {}",
        record.status, record.host, record.addr, record.path, record.snippet
    )
}

/// One JSON object per line.
pub fn format_json(record: &ScanRecord) -> String {
    serde_json::to_string(record)
        .unwrap_or_else(|e| format!("{{\"error\":\"serialization failed: {e}\"}}"))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::net::Ipv4Addr;

    fn record() -> ScanRecord {
        ScanRecord {
            host: "www.example.com".to_string(),
            addr: Ipv4Addr::new(93, 184, 216, 34),
            path: "/".to_string(),
            status: 200,
            snippet: "<!doctype html><html".to_string(),
            scanned_at: Utc::now(),
        }
    }

    #[test]
    fn test_pretty_line_contains_everything() {
        let line = format_pretty(&record());
        assert_eq!(line, "200 www.example.com (93.184.216.34) /: <!doctype html><html");
    }

    #[test]
    fn test_json_line_is_parseable() {
        let line = format_json(&record());
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["status"], 200);
        assert_eq!(value["host"], "www.example.com");
        assert_eq!(value["path"], "/");
    }
}
