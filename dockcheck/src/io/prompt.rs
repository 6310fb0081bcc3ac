//! Step prompt builder.
//!
//! The template marks each section with `<!-- section:KEY required|droppable -->`.
//! When the rendered prompt exceeds the byte budget, droppable sections are
//! removed in a fixed order until it fits.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::types::{RunContext, StepConfig};

const STEP_TEMPLATE: &str = include_str!("prompts/step.md");

/// Agent CLIs receive the prompt as an argument; keep it well under argv limits.
pub const DEFAULT_PROMPT_BUDGET_BYTES: usize = 100_000;

/// Removal order when over budget. The diff goes first since the file list
/// still tells the agent where to look.
const DROP_ORDER: [&str; 2] = ["diff", "files"];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex should compile")
});

#[derive(Debug, Clone, Serialize)]
struct StepView<'a> {
    name: &'a str,
    skill: &'a str,
    depends_on: &'a [String],
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

/// Renders the prompt for one pipeline step.
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_BUDGET_BYTES)
    }
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        env.add_template("step", STEP_TEMPLATE)
            .expect("step template should be valid");
        Self { env, budget_bytes }
    }

    pub fn build_step(&self, step: &StepConfig, run: &RunContext) -> Result<String> {
        let template = self.env.get_template("step").context("load step template")?;
        let rendered = template
            .render(context! {
                step => StepView {
                    name: &step.name,
                    skill: &step.skill,
                    depends_on: &step.depends_on,
                },
                files => run.file_paths,
                diff => run.diff.as_deref().map(str::trim).filter(|d| !d.is_empty()),
            })
            .with_context(|| format!("render prompt for step '{}'", step.name))?;

        let mut sections = parse_sections(&rendered);
        fit_to_budget(&mut sections, self.budget_bytes);
        Ok(join_sections(&sections))
    }
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());

    for (i, caps) in markers.iter().enumerate() {
        let (Some(marker), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |next| next.start());
        let content = rendered[marker.end()..end].trim().to_string();
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

fn fit_to_budget(sections: &mut Vec<Section>, budget: usize) {
    let total = |secs: &[Section]| secs.iter().map(|s| s.content.len()).sum::<usize>();

    for key in DROP_ORDER {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            let dropped = sections.remove(idx);
            debug!(
                section = key,
                bytes = dropped.content.len(),
                budget,
                "dropped prompt section"
            );
        }
    }

    if total(sections) > budget {
        warn!(
            bytes = total(sections),
            budget, "prompt still over budget after dropping optional sections"
        );
    }
}

fn join_sections(sections: &[Section]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
