//! Textual result protocol between the orchestrator and generated programs.
//!
//! A program reports success by printing a block framed by two marker lines
//! around a JSON payload:
//!
//! ```text
//! FINAL_OUTPUT_START
//! {"answer": 42}
//! FINAL_OUTPUT_END
//! ```
//!
//! and reports failure by printing a single `FINAL_OUTPUT_ERROR: <message>` line.
//! Marker lines are compared after trimming surrounding whitespace. Output
//! outside the block is tolerated; only the first block counts.

use serde_json::Value;

/// Line that opens the result block.
pub const RESULT_START: &str = "FINAL_OUTPUT_START";
/// Line that closes the result block.
pub const RESULT_END: &str = "FINAL_OUTPUT_END";
/// Prefix of the single line a program prints when it gives up.
pub const ERROR_MARKER: &str = "FINAL_OUTPUT_ERROR:";

/// Result of scanning stdout for the first result block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockScan<'a> {
    /// Both markers found; payload is the trimmed text between them.
    Complete(&'a str),
    /// Start marker found without a matching end marker.
    Unterminated,
    /// No start marker.
    Missing,
}

/// Locate the first result block in `stdout`.
pub fn scan_result_block(stdout: &str) -> BlockScan<'_> {
    let mut offset = 0usize;
    let mut payload_start: Option<usize> = None;

    for line in stdout.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let trimmed = line.trim();
        match payload_start {
            None if trimmed == RESULT_START => payload_start = Some(offset),
            Some(start) if trimmed == RESULT_END => {
                return BlockScan::Complete(stdout[start..line_start].trim());
            }
            _ => {}
        }
    }

    if payload_start.is_some() {
        BlockScan::Unterminated
    } else {
        BlockScan::Missing
    }
}

/// Message of the first error-marker line, if any.
pub fn find_error_message(output: &str) -> Option<&str> {
    output.lines().find_map(|line| {
        line.trim_start()
            .strip_prefix(ERROR_MARKER)
            .map(str::trim)
    })
}

/// Render `value` the way a conforming program would print it.
pub fn render_result_block(value: &Value) -> String {
    format!("{RESULT_START}\n{value}\n{RESULT_END}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finds_payload_between_marker_lines() {
        let stdout = "debug line\nFINAL_OUTPUT_START\n  [1, 2]  \nFINAL_OUTPUT_END\ntrailing\n";
        assert_eq!(scan_result_block(stdout), BlockScan::Complete("[1, 2]"));
    }

    #[test]
    fn tolerates_indented_markers_and_crlf() {
        let stdout = "  FINAL_OUTPUT_START\r\n\"hi\"\r\n\tFINAL_OUTPUT_END\r\n";
        assert_eq!(scan_result_block(stdout), BlockScan::Complete("\"hi\""));
    }

    #[test]
    fn first_block_wins() {
        let stdout = "FINAL_OUTPUT_START\n1\nFINAL_OUTPUT_END\nFINAL_OUTPUT_START\n2\nFINAL_OUTPUT_END\n";
        assert_eq!(scan_result_block(stdout), BlockScan::Complete("1"));
    }

    #[test]
    fn end_without_newline_is_accepted() {
        assert_eq!(
            scan_result_block("FINAL_OUTPUT_START\n4\nFINAL_OUTPUT_END"),
            BlockScan::Complete("4")
        );
    }

    #[test]
    fn reports_unterminated_and_missing_blocks() {
        assert_eq!(
            scan_result_block("FINAL_OUTPUT_START\n4\n"),
            BlockScan::Unterminated
        );
        assert_eq!(scan_result_block("4\n"), BlockScan::Missing);
        assert_eq!(scan_result_block(""), BlockScan::Missing);
    }

    #[test]
    fn markers_must_be_whole_lines() {
        let stdout = "print FINAL_OUTPUT_START here\n4\n";
        assert_eq!(scan_result_block(stdout), BlockScan::Missing);
    }

    #[test]
    fn end_marker_before_start_is_ignored() {
        let stdout = "FINAL_OUTPUT_END\nFINAL_OUTPUT_START\n5\nFINAL_OUTPUT_END\n";
        assert_eq!(scan_result_block(stdout), BlockScan::Complete("5"));
    }

    #[test]
    fn error_message_is_extracted() {
        let stdout = "noise\n  FINAL_OUTPUT_ERROR: file not found \nmore\n";
        assert_eq!(find_error_message(stdout), Some("file not found"));
        assert_eq!(find_error_message("error: nope"), None);
    }

    #[test]
    fn rendered_block_scans_back() {
        let value = json!({"a": [1, "two", null]});
        let rendered = render_result_block(&value);
        let BlockScan::Complete(payload) = scan_result_block(&rendered) else {
            panic!("expected complete block");
        };
        let decoded: Value = serde_json::from_str(payload).expect("json");
        assert_eq!(decoded, value);
    }
}
