//! Content extraction for model output.
//!
//! Model responses partition into a thinking prefix and a report body via
//! two literal sentinels, and may carry inline tool-call markers that must
//! never reach a client. Everything here is pure text processing.

use std::sync::OnceLock;

use regex::Regex;

/// Marks the end of the thinking prefix. Bit-exact wire literal.
pub const THINKING_ENDS: &str = "<<<<THINKING_ENDS>>>>";
/// Marks the start of the report body. Bit-exact wire literal.
pub const REPORT_STARTS: &str = "<<<<REPORT_STARTS>>>>";

const FUNCTION_CALL_BEGIN: &str = "<|FunctionCallBegin|>";
const FUNCTION_CALL_END: &str = "<|FunctionCallEnd|>";

/// Thinking/report partition of a full response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtractedContent {
    pub thinking: String,
    pub report: String,
}

/// Split a complete response on the two sentinels.
///
/// Both markers present: text before `THINKING_ENDS` is thinking, text after
/// `REPORT_STARTS` is the report. Otherwise the whole text is thinking and
/// the report is empty.
pub fn split_sentinels(text: &str) -> ExtractedContent {
    let thinking_at = text.find(THINKING_ENDS);
    let report_at = text.find(REPORT_STARTS);

    match (thinking_at, report_at) {
        (Some(t), Some(r)) => ExtractedContent {
            thinking: text[..t].trim().to_string(),
            report: text[r + REPORT_STARTS.len()..].trim().to_string(),
        },
        _ => ExtractedContent {
            thinking: text.trim().to_string(),
            report: String::new(),
        },
    }
}

fn tool_marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<\|FunctionCallBegin\|>.*?<\|FunctionCallEnd\|>")
            .expect("static regex compiles")
    })
}

/// Remove every inline tool-call span from a complete text.
pub fn strip_tool_call_markers(text: &str) -> String {
    tool_marker_regex().replace_all(text, "").into_owned()
}

/// Streaming filter that drops tool-call spans even when the markers are
/// split across chunk boundaries.
///
/// Feed chunks as they arrive; [`ToolMarkerFilter::feed`] returns the text
/// that is safe to surface. Call [`ToolMarkerFilter::finish`] when the stream
/// closes to flush any held-back suffix.
#[derive(Debug, Default)]
pub struct ToolMarkerFilter {
    inside_call: bool,
    carry: String,
}

impl ToolMarkerFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &str) -> String {
        self.carry.push_str(chunk);
        let mut out = String::new();

        loop {
            if self.inside_call {
                match self.carry.find(FUNCTION_CALL_END) {
                    Some(pos) => {
                        self.carry.drain(..pos + FUNCTION_CALL_END.len());
                        self.inside_call = false;
                    }
                    None => {
                        // Keep only a possible partial end marker.
                        let keep = partial_suffix_len(&self.carry, FUNCTION_CALL_END);
                        self.carry.drain(..self.carry.len() - keep);
                        return out;
                    }
                }
            } else {
                match self.carry.find(FUNCTION_CALL_BEGIN) {
                    Some(pos) => {
                        out.push_str(&self.carry[..pos]);
                        self.carry.drain(..pos + FUNCTION_CALL_BEGIN.len());
                        self.inside_call = true;
                    }
                    None => {
                        let keep = partial_suffix_len(&self.carry, FUNCTION_CALL_BEGIN);
                        let emit_to = self.carry.len() - keep;
                        out.push_str(&self.carry[..emit_to]);
                        self.carry.drain(..emit_to);
                        return out;
                    }
                }
            }
        }
    }

    /// Flush whatever is held back. Text inside an unterminated call span
    /// is discarded.
    pub fn finish(&mut self) -> String {
        if self.inside_call {
            self.carry.clear();
            return String::new();
        }
        std::mem::take(&mut self.carry)
    }
}

/// Longest suffix of `text` that is a proper prefix of `marker`.
fn partial_suffix_len(text: &str, marker: &str) -> usize {
    let max = marker.len().saturating_sub(1).min(text.len());
    for len in (1..=max).rev() {
        if !text.is_char_boundary(text.len() - len) {
            continue;
        }
        if marker.starts_with(&text[text.len() - len..]) {
            return len;
        }
    }
    0
}

/// Normalize a report body: trim, guarantee a heading, fall back to a stub
/// section when the model produced nothing usable.
pub fn normalize_report(content: &str, fallback_title: &str) -> String {
    let cleaned = strip_tool_call_markers(content);
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return format!(
            "## {}\n\nNo usable analysis was produced for this section.",
            fallback_title
        );
    }
    if trimmed.starts_with('#') {
        trimmed.to_string()
    } else {
        format!("## {}\n\n{}", fallback_title, trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_both_markers() {
        let text = format!("foo{}bar{}baz", THINKING_ENDS, REPORT_STARTS);
        let extracted = split_sentinels(&text);
        assert_eq!(extracted.thinking, "foo");
        assert_eq!(extracted.report, "baz");
    }

    #[test]
    fn test_split_no_markers_is_all_thinking() {
        let extracted = split_sentinels("just some musing");
        assert_eq!(extracted.thinking, "just some musing");
        assert_eq!(extracted.report, "");
    }

    #[test]
    fn test_split_single_marker_is_all_thinking() {
        let text = format!("foo{}bar", THINKING_ENDS);
        let extracted = split_sentinels(&text);
        assert_eq!(extracted.report, "");
        assert!(extracted.thinking.contains("foo"));
    }

    #[test]
    fn test_split_trims_whitespace() {
        let text = format!("  foo  {}bar{}  baz  ", THINKING_ENDS, REPORT_STARTS);
        let extracted = split_sentinels(&text);
        assert_eq!(extracted.thinking, "foo");
        assert_eq!(extracted.report, "baz");
    }

    #[test]
    fn test_strip_tool_markers() {
        let text = "before<|FunctionCallBegin|>{\"q\":\"x\"}<|FunctionCallEnd|>after";
        assert_eq!(strip_tool_call_markers(text), "beforeafter");
    }

    #[test]
    fn test_strip_is_non_greedy() {
        let text = "a<|FunctionCallBegin|>1<|FunctionCallEnd|>b<|FunctionCallBegin|>2<|FunctionCallEnd|>c";
        assert_eq!(strip_tool_call_markers(text), "abc");
    }

    #[test]
    fn test_strip_spans_newlines() {
        let text = "x<|FunctionCallBegin|>{\n\"q\": 1\n}<|FunctionCallEnd|>y";
        assert_eq!(strip_tool_call_markers(text), "xy");
    }

    #[test]
    fn test_filter_passthrough() {
        let mut filter = ToolMarkerFilter::new();
        let mut out = filter.feed("plain text ");
        out.push_str(&filter.feed("more text"));
        out.push_str(&filter.finish());
        assert_eq!(out, "plain text more text");
    }

    #[test]
    fn test_filter_strips_span_within_chunk() {
        let mut filter = ToolMarkerFilter::new();
        let mut out =
            filter.feed("a<|FunctionCallBegin|>hidden<|FunctionCallEnd|>b");
        out.push_str(&filter.finish());
        assert_eq!(out, "ab");
    }

    #[test]
    fn test_filter_strips_span_split_across_chunks() {
        let mut filter = ToolMarkerFilter::new();
        let mut out = String::new();
        out.push_str(&filter.feed("a<|Function"));
        out.push_str(&filter.feed("CallBegin|>hid"));
        out.push_str(&filter.feed("den<|FunctionCall"));
        out.push_str(&filter.feed("End|>b"));
        out.push_str(&filter.finish());
        assert_eq!(out, "ab");
    }

    #[test]
    fn test_filter_false_prefix_is_released() {
        let mut filter = ToolMarkerFilter::new();
        let mut out = String::new();
        out.push_str(&filter.feed("value <|Func"));
        out.push_str(&filter.feed("tional spec"));
        out.push_str(&filter.finish());
        assert_eq!(out, "value <|Functional spec");
    }

    #[test]
    fn test_filter_discards_unterminated_span() {
        let mut filter = ToolMarkerFilter::new();
        let mut out = filter.feed("a<|FunctionCallBegin|>never ends");
        out.push_str(&filter.finish());
        assert_eq!(out, "a");
    }

    #[test]
    fn test_normalize_adds_heading() {
        let normalized = normalize_report("plain prose", "Trend Insights");
        assert!(normalized.starts_with("## Trend Insights"));
        assert!(normalized.contains("plain prose"));
    }

    #[test]
    fn test_normalize_keeps_existing_heading() {
        let normalized = normalize_report("# Already titled\nbody", "Ignored");
        assert!(normalized.starts_with("# Already titled"));
    }

    #[test]
    fn test_normalize_empty_produces_stub() {
        let normalized = normalize_report("   ", "Competitive Landscape");
        assert!(normalized.contains("Competitive Landscape"));
        assert!(normalized.contains("No usable analysis"));
    }
}
