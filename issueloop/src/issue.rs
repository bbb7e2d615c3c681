//! Issue records: a text file with a `key: value` header block and an
//! append-only history of result blocks.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::IssueStatus;

/// Priority used when the header is missing, unparsable, or `<= 0`.
pub const DEFAULT_PRIORITY: i64 = 1000;

/// Marker that opens every appended result block.
pub const RESULT_HEADING: &str = "## Result";

static HEADER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)(id|role|status|title|priority|story_id)\s*:\s*(.*)$").expect("header regex")
});

static CHECKLIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*]\s+\[( |x|X)\]").expect("checklist regex"));

/// Parsed view of an issue file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    /// File name inside its queue directory.
    pub name: String,
    pub id: String,
    pub role: Option<String>,
    pub status: Option<IssueStatus>,
    pub title: String,
    pub priority: i64,
    pub story_id: Option<String>,
    pub contents: String,
}

impl Issue {
    pub fn parse(name: &str, contents: &str) -> Self {
        let mut id = None;
        let mut role = None;
        let mut status = None;
        let mut title = None;
        let mut priority = None;
        let mut story_id = None;

        for (key, value) in header_lines(contents) {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.as_str() {
                "id" => id = Some(value.to_string()),
                "role" => role = Some(value.to_ascii_lowercase()),
                "status" => status = IssueStatus::parse(value),
                "title" => title = Some(value.to_string()),
                "priority" => priority = value.parse::<i64>().ok(),
                "story_id" => story_id = Some(value.to_string()),
                _ => {}
            }
        }

        let title = title
            .or_else(|| heading_title(contents))
            .unwrap_or_else(|| stem(name).to_string());

        Self {
            name: name.to_string(),
            id: id.unwrap_or_else(|| stem(name).to_string()),
            role,
            status,
            title,
            priority: normalize_priority(priority),
            story_id,
            contents: contents.to_string(),
        }
    }

    /// Body text without the appended result history.
    pub fn body(&self) -> &str {
        match history_start(&self.contents) {
            Some(idx) => &self.contents[..idx],
            None => &self.contents,
        }
    }

    /// Appended result blocks only.
    pub fn history(&self) -> &str {
        match history_start(&self.contents) {
            Some(idx) => &self.contents[idx..],
            None => "",
        }
    }
}

/// Byte offset of the first line that is exactly the result heading.
fn history_start(contents: &str) -> Option<usize> {
    let mut offset = 0;
    for line in contents.split_inclusive('\n') {
        if line.trim_end() == RESULT_HEADING {
            return Some(offset);
        }
        offset += line.len();
    }
    None
}

pub fn normalize_priority(priority: Option<i64>) -> i64 {
    match priority {
        Some(p) if p > 0 => p,
        _ => DEFAULT_PRIORITY,
    }
}

/// Rewrite (or insert) the `status:` header line.
pub fn set_status(contents: &str, status: IssueStatus) -> String {
    let mut out = Vec::new();
    let mut replaced = false;
    let mut in_header = true;
    for line in contents.lines() {
        if in_header && !replaced {
            if let Some((key, _)) = parse_header(line)
                && key == "status"
            {
                out.push(format!("status: {}", status.as_str()));
                replaced = true;
                continue;
            }
            if is_header_end(line, &out) {
                in_header = false;
            }
        }
        out.push(line.to_string());
    }

    if !replaced {
        let insert_at = header_insert_index(&out);
        out.insert(insert_at, format!("status: {}", status.as_str()));
    }

    let mut rendered = out.join("\n");
    if contents.ends_with('\n') || !replaced {
        rendered.push('\n');
    }
    rendered
}

/// Append a result block to the issue history.
pub fn append_result(contents: &str, block: &ResultBlock<'_>) -> String {
    let mut out = contents.to_string();
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out.push('\n');
    out.push_str(RESULT_HEADING);
    out.push('\n');
    out.push_str(&format!("- timestamp: {}\n", block.timestamp));
    out.push_str(&format!("- status: {}\n", block.status));
    out.push_str(&format!("- reason: {}\n", block.reason.unwrap_or("none")));
    out.push_str(&format!("- log_file: {}\n", block.log_file.unwrap_or("none")));
    out
}

#[derive(Debug, Clone)]
pub struct ResultBlock<'a> {
    pub timestamp: &'a str,
    pub status: &'a str,
    pub reason: Option<&'a str>,
    pub log_file: Option<&'a str>,
}

/// Checklist counts in the issue body: `(total, checked)`.
pub fn checklist_counts(body: &str) -> (usize, usize) {
    let mut total = 0;
    let mut checked = 0;
    for line in body.lines() {
        if let Some(caps) = CHECKLIST_ITEM.captures(line) {
            total += 1;
            if caps[1].eq_ignore_ascii_case("x") {
                checked += 1;
            }
        }
    }
    (total, checked)
}

fn header_lines(contents: &str) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    let mut seen_any = false;
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if seen_any {
                break;
            }
            continue;
        }
        if trimmed.starts_with('#') && !seen_any {
            continue;
        }
        match parse_header(trimmed) {
            Some(pair) => {
                seen_any = true;
                headers.push(pair);
            }
            None => break,
        }
    }
    headers
}

fn parse_header(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim().trim_start_matches("- ");
    let caps = HEADER_LINE.captures(trimmed)?;
    Some((caps[1].to_ascii_lowercase(), caps[2].to_string()))
}

fn is_header_end(line: &str, seen: &[String]) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return seen.iter().any(|l| parse_header(l).is_some());
    }
    !(trimmed.starts_with('#') || parse_header(trimmed).is_some())
}

fn header_insert_index(lines: &[String]) -> usize {
    let mut idx = 0;
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with('#') && i == idx {
            idx = i + 1;
            continue;
        }
        if parse_header(trimmed).is_some() {
            idx = i + 1;
            continue;
        }
        break;
    }
    idx
}

fn heading_title(contents: &str) -> Option<String> {
    contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.strip_prefix("# "))
        .map(|title| title.trim().to_string())
}

fn stem(name: &str) -> &str {
    Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "# Add login page\nid: ISS-7\nrole: Developer\nstatus: ready\npriority: 500\nstory_id: S-2\n\nBuild it.\n- [ ] form\n- [x] route\n";

    #[test]
    fn parses_headers_and_heading_title() {
        let issue = Issue::parse("20260101-ISS-7.md", SAMPLE);
        assert_eq!(issue.id, "ISS-7");
        assert_eq!(issue.role.as_deref(), Some("developer"));
        assert_eq!(issue.status, Some(IssueStatus::Ready));
        assert_eq!(issue.title, "Add login page");
        assert_eq!(issue.priority, 500);
        assert_eq!(issue.story_id.as_deref(), Some("S-2"));
    }

    #[test]
    fn missing_or_non_positive_priority_uses_default() {
        let issue = Issue::parse("a.md", "role: qa\nstatus: ready\npriority: 0\n");
        assert_eq!(issue.priority, DEFAULT_PRIORITY);
        let issue = Issue::parse("a.md", "role: qa\nstatus: ready\n");
        assert_eq!(issue.priority, DEFAULT_PRIORITY);
        assert_eq!(issue.id, "a");
    }

    #[test]
    fn body_lines_after_blank_are_not_headers() {
        let issue = Issue::parse("a.md", "status: ready\n\nrole: qa\n");
        assert_eq!(issue.role, None);
    }

    #[test]
    fn set_status_replaces_existing_header_only() {
        let updated = set_status(SAMPLE, IssueStatus::InProgress);
        assert!(updated.contains("status: in-progress\n"));
        assert!(!updated.contains("status: ready"));
        assert_eq!(updated.lines().count(), SAMPLE.lines().count());
        assert!(updated.contains("- [ ] form"));
    }

    #[test]
    fn set_status_inserts_when_missing() {
        let updated = set_status("# Title\nrole: qa\n\nbody\n", IssueStatus::Blocked);
        assert_eq!(updated, "# Title\nrole: qa\nstatus: blocked\n\nbody\n");
        let issue = Issue::parse("x.md", &updated);
        assert_eq!(issue.status, Some(IssueStatus::Blocked));
    }

    #[test]
    fn set_status_ignores_status_words_in_result_history() {
        let with_history = append_result(
            SAMPLE,
            &ResultBlock {
                timestamp: "t",
                status: "requeued",
                reason: Some("r"),
                log_file: None,
            },
        );
        let updated = set_status(&with_history, IssueStatus::Done);
        assert!(updated.contains("- status: requeued"));
        assert_eq!(
            Issue::parse("x.md", &updated).status,
            Some(IssueStatus::Done)
        );
    }

    #[test]
    fn append_result_splits_body_and_history() {
        let updated = append_result(
            SAMPLE,
            &ResultBlock {
                timestamp: "2026-01-01T00:00:00Z",
                status: "blocked",
                reason: Some("codex_auth_error"),
                log_file: Some("/tmp/run.log"),
            },
        );
        let issue = Issue::parse("x.md", &updated);
        assert!(issue.history().starts_with(RESULT_HEADING));
        assert!(issue.history().contains("- reason: codex_auth_error"));
        assert!(!issue.body().contains(RESULT_HEADING));
    }

    #[test]
    fn inline_result_heading_is_part_of_the_body() {
        let contents = "status: ready\n\nQuote `## Result` in the docs.\n  ## Result is indented here\n";
        let issue = Issue::parse("x.md", contents);
        assert_eq!(issue.body(), contents);
        assert_eq!(issue.history(), "");

        let updated = append_result(
            contents,
            &ResultBlock {
                timestamp: "2026-01-01T00:00:00Z",
                status: "requeued",
                reason: Some("validation_failed"),
                log_file: None,
            },
        );
        let issue = Issue::parse("x.md", &updated);
        assert_eq!(issue.history().matches(RESULT_HEADING).count(), 1);
        assert!(issue.body().contains("Quote `## Result` in the docs."));
    }

    #[test]
    fn counts_checklist_items() {
        assert_eq!(checklist_counts(SAMPLE), (2, 1));
        assert_eq!(checklist_counts("no list"), (0, 0));
    }
}
