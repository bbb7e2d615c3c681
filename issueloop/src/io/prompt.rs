//! Prompt builder for one issue.
//!
//! The template is split into sections by `<!-- section:KEY required|droppable -->`
//! markers; when the rendered prompt exceeds the byte budget, droppable
//! sections go first and the last remaining section is truncated.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::issue::Issue;

const ISSUE_TEMPLATE: &str = include_str!("prompts/issue.md");

pub const DEFAULT_PROMPT_BUDGET: usize = 64 * 1024;

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section regex")
});

/// Everything the template needs besides the issue itself.
#[derive(Debug, Clone, Default)]
pub struct PromptInputs<'a> {
    pub project_dir: &'a str,
    pub exit_signal: Option<&'a str>,
    pub handoff_path: Option<&'a str>,
    pub handoff_fields: &'a [String],
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_BUDGET)
    }
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build(&self, issue: &Issue, inputs: &PromptInputs<'_>) -> Result<String> {
        let mut env = Environment::new();
        env.add_template("issue", ISSUE_TEMPLATE)
            .context("load issue prompt template")?;
        let template = env.get_template("issue")?;
        let history = issue.history().trim();
        let rendered = template
            .render(context! {
                role => issue.role.as_deref().unwrap_or("developer"),
                project_dir => inputs.project_dir,
                issue_id => issue.id.as_str(),
                title => (!issue.title.is_empty()).then_some(issue.title.as_str()),
                body => issue.body().trim(),
                history => (!history.is_empty()).then_some(history),
                exit_signal => inputs.exit_signal,
                handoff_path => inputs.handoff_path,
                handoff_fields => inputs.handoff_fields,
            })
            .context("render issue prompt")?;

        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    let total = |secs: &[Section]| -> usize { secs.iter().map(|s| s.content.len()).sum() };
    while total(sections) > budget {
        let Some(idx) = sections.iter().rposition(|s| !s.required) else {
            break;
        };
        debug!(section = %sections[idx].key, bytes_dropped = sections[idx].content.len(), "dropped prompt section");
        sections.remove(idx);
    }

    let over = total(sections).saturating_sub(budget);
    if over == 0 {
        return;
    }
    if let Some(last) = sections.last_mut() {
        let mut keep = last.content.len().saturating_sub(over + 12);
        while keep > 0 && !last.content.is_char_boundary(keep) {
            keep -= 1;
        }
        last.content.truncate(keep);
        last.content.push_str("\n[truncated]");
        debug!(section = %last.key, after_len = last.content.len(), "truncated prompt section");
    }
}
