//! Prompt rendering for model invocations.
//!
//! Templates mark sections with `<!-- section:KEY required|droppable -->`. When a
//! rendered prompt exceeds its byte budget, droppable sections go first, then the
//! last remaining section is truncated.

use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::budget::truncate_with_notice;
use crate::core::types::Phase;

const RESEARCH_TEMPLATE: &str = include_str!("prompts/research.md");
const DECOMPOSITION_TEMPLATE: &str = include_str!("prompts/decomposition.md");
const TDD_PLANNING_TEMPLATE: &str = include_str!("prompts/tdd_planning.md");
const IMPLEMENTATION_TEMPLATE: &str = include_str!("prompts/implementation.md");

/// Droppable sections, least important first.
const DROP_ORDER: [&str; 2] = ["context", "failure"];

/// Inputs for the research, decomposition and planning prompts.
#[derive(Debug, Clone, Default)]
pub struct PhasePromptInputs {
    pub goal: String,
    /// Rendered working context (summaries only).
    pub working_context: String,
    /// Artifact of the previous phase, when there is one.
    pub upstream: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptIssue {
    pub id: String,
    pub title: String,
    pub plan_path: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ImplementationPromptInputs {
    pub epic_id: Option<String>,
    pub issues: Vec<PromptIssue>,
    pub plan_paths: Vec<String>,
    /// Rendered implementation context (full content of the requested entries).
    pub implementation_context: String,
    pub failure: Option<String>,
}

struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        for (name, source) in [
            (Phase::Research.as_str(), RESEARCH_TEMPLATE),
            (Phase::Decomposition.as_str(), DECOMPOSITION_TEMPLATE),
            (Phase::TddPlanning.as_str(), TDD_PLANNING_TEMPLATE),
            (Phase::Implementation.as_str(), IMPLEMENTATION_TEMPLATE),
        ] {
            env.add_template(name, source)
                .with_context(|| format!("load {name} prompt template"))?;
        }
        Ok(Self { env })
    }

    fn render_phase(&self, phase: Phase, input: &PhasePromptInputs) -> Result<String> {
        let template = self
            .env
            .get_template(phase.as_str())
            .map_err(|_| anyhow!("no prompt template for phase {phase}"))?;
        let rendered = template.render(context! {
            goal => input.goal.trim(),
            working_context => non_blank(&input.working_context),
            upstream => input.upstream.as_deref().and_then(non_blank),
        })?;
        Ok(rendered)
    }

    fn render_implementation(&self, input: &ImplementationPromptInputs) -> Result<String> {
        let template = self.env.get_template(Phase::Implementation.as_str())?;
        let rendered = template.render(context! {
            epic_id => input.epic_id.as_deref(),
            issues => &input.issues,
            plan_paths => &input.plan_paths,
            implementation_context => non_blank(&input.implementation_context),
            failure => input.failure.as_deref().and_then(non_blank),
        })?;
        Ok(rendered)
    }
}

fn non_blank(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Builds prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    /// Prompt for a research, decomposition or planning phase.
    pub fn build_phase(&self, phase: Phase, input: &PhasePromptInputs) -> Result<String> {
        let rendered = PromptEngine::new()?.render_phase(phase, input)?;
        Ok(self.fit(&rendered))
    }

    pub fn build_implementation(&self, input: &ImplementationPromptInputs) -> Result<String> {
        let rendered = PromptEngine::new()?.render_implementation(input)?;
        Ok(self.fit(&rendered))
    }

    fn fit(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget_bytes);
        sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    static SECTION_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").ok()
    });
    let Some(re) = SECTION_RE.as_ref() else {
        return vec![Section {
            key: "all".to_string(),
            required: true,
            content: rendered.trim().to_string(),
        }];
    };

    let markers: Vec<(usize, usize, String, bool)> = re
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let key = caps.get(1)?.as_str().to_string();
            let required = caps.get(2)?.as_str() == "required";
            Some((whole.start(), whole.end(), key, required))
        })
        .collect();

    let mut sections = Vec::new();
    for (idx, (_, body_start, key, required)) in markers.iter().enumerate() {
        let end = markers
            .get(idx + 1)
            .map(|next| next.0)
            .unwrap_or(rendered.len());
        let content = rendered[*body_start..end].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(Section {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    let total = |secs: &[Section]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let used = total(sections);
    if used <= budget {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let allowed = budget.saturating_sub(used - last.content.len());
    let before_len = last.content.len();
    last.content = truncate_with_notice(&last.content, allowed);
    debug!(
        section = %last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase_inputs() -> PhasePromptInputs {
        PhasePromptInputs {
            goal: "Add a retry policy to the HTTP client".to_string(),
            working_context: "- [ctx-1] FILE research.md: Client overview".to_string(),
            upstream: Some("1. Retries are bounded".to_string()),
        }
    }

    #[test]
    fn phase_prompt_orders_sections() {
        let prompt = PromptBuilder::new(100_000)
            .build_phase(Phase::Decomposition, &phase_inputs())
            .expect("render");
        let contract = prompt.find("<contract>").expect("contract");
        let goal = prompt.find("### Goal").expect("goal");
        let research = prompt.find("### Research").expect("research");
        let context = prompt.find("### Known Context").expect("context");
        assert!(contract < goal && goal < research && research < context);
        assert!(!prompt.contains("<!--"), "markers are stripped");
    }

    #[test]
    fn research_prompt_omits_empty_context() {
        let mut input = phase_inputs();
        input.working_context.clear();
        let prompt = PromptBuilder::new(100_000)
            .build_phase(Phase::Research, &input)
            .expect("render");
        assert!(prompt.contains("Add a retry policy"));
        assert!(!prompt.contains("### Known Context"));
    }

    #[test]
    fn phase_without_template_is_an_error() {
        let err = PromptBuilder::new(100)
            .build_phase(Phase::MultiDoc, &phase_inputs())
            .expect_err("no template");
        assert!(err.to_string().contains("multi_doc"));
    }

    #[test]
    fn implementation_prompt_lists_issues_and_plans() {
        let input = ImplementationPromptInputs {
            epic_id: Some("bd-1".to_string()),
            issues: vec![PromptIssue {
                id: "bd-2".to_string(),
                title: "Parse config".to_string(),
                plan_path: Some("/p/plans/01-parse-config.md".to_string()),
            }],
            plan_paths: vec!["/p/plans/01-parse-config.md".to_string()],
            implementation_context: "### [ctx-4] PLAN 01\n\nwrite tests".to_string(),
            failure: Some("test config::parse failed".to_string()),
        };
        let prompt = PromptBuilder::new(100_000)
            .build_implementation(&input)
            .expect("render");
        assert!(prompt.contains("Epic: bd-1"));
        assert!(prompt.contains("- bd-2: Parse config (plan: /p/plans/01-parse-config.md)"));
        assert!(prompt.contains("### Last Test Failure"));
        assert!(prompt.contains("write tests"));
    }

    /// Droppable sections are removed before required ones are cut.
    #[test]
    fn budget_drops_context_first() {
        let mut input = phase_inputs();
        input.working_context = "summary line\n".repeat(500);
        let prompt = PromptBuilder::new(1_000)
            .build_phase(Phase::Decomposition, &input)
            .expect("render");
        assert!(!prompt.contains("### Known Context"));
        assert!(prompt.contains("### Goal"));
        assert!(prompt.contains("### Research"));
    }

    #[test]
    fn budget_truncates_last_required_section() {
        let mut input = phase_inputs();
        input.working_context.clear();
        input.upstream = Some("x".repeat(5_000));
        let prompt = PromptBuilder::new(1_500)
            .build_phase(Phase::Decomposition, &input)
            .expect("render");
        assert!(prompt.contains("[truncated"));
        assert!(prompt.len() < 1_700);
    }
}
