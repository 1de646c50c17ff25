//! Deterministic summaries for demoted and superseded content.

/// Summarize `content` by keeping its first `head` and last `tail` lines.
///
/// Content that already fits in `head + tail` lines is returned as is.
pub fn summarize(path: &str, content: &str, head: usize, tail: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();

    if total <= head + tail {
        return content.to_string();
    }

    let mut out = format!("[summary of {path}: {total} lines]\n");
    for line in &lines[..head] {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(&format!("... [{} lines omitted] ...\n", total - head - tail));
    for line in &lines[total - tail..] {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// A short summary of content that is being replaced: header plus the
/// first few lines.
pub fn short_summary(path: &str, version: u32, content: &str, lines: usize) -> String {
    let total = content.lines().count();
    let mut out = format!("[{path} v{version}: {total} lines]");
    for line in content.lines().take(lines) {
        out.push('\n');
        out.push_str(line);
    }
    if total > lines {
        out.push_str("\n...");
    }
    out
}
