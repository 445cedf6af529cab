//! Prompt scene planning and rendering

use crate::retrieval::RetrievalContext;

/// Which evidence channels produced context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scene {
    KbOnly,
    McpOnly,
    Mixed,
    Empty,
}

impl Scene {
    pub fn select(kb_context: &str, mcp_context: &str) -> Self {
        match (kb_context.trim().is_empty(), mcp_context.trim().is_empty()) {
            (false, true) => Scene::KbOnly,
            (true, false) => Scene::McpOnly,
            (false, false) => Scene::Mixed,
            (true, true) => Scene::Empty,
        }
    }

    fn default_template(self) -> &'static str {
        match self {
            Scene::KbOnly => KB_ONLY_TEMPLATE,
            Scene::McpOnly => MCP_ONLY_TEMPLATE,
            Scene::Mixed => MIXED_TEMPLATE,
            Scene::Empty => "%s",
        }
    }
}

pub const INTENT_RULES_PLACEHOLDER: &str = "{{INTENT_RULES}}";
const INTENT_RULES_HEADER: &str = "## Intent rules";

const KB_ONLY_TEMPLATE: &str = "You are a knowledge-base assistant. Answer using only the reference \
material below. If it does not cover the question, say that you don't know.

{{INTENT_RULES}}

## Reference material
%s

## Question
%s";

const MCP_ONLY_TEMPLATE: &str = "You are an assistant with access to live tool results. Answer using \
only the tool output below and quote figures exactly as returned.

{{INTENT_RULES}}

## Tool results
%s

## Question
%s";

const MIXED_TEMPLATE: &str = "You are an assistant combining live tool results with knowledge-base \
material. Prefer tool output for current facts and the reference material for policy and background.

{{INTENT_RULES}}

## Tool results
%s

## Reference material
%s

## Question
%s";

/// Everything the renderer needs; consumed once
#[derive(Debug, Clone, PartialEq)]
pub struct PromptBuildPlan {
    pub scene: Scene,
    /// A participating intent's own template, used verbatim
    pub base_template: Option<String>,
    /// Deduplicated, trimmed rule snippets
    pub rules: Vec<String>,
    /// Positional `%s` values
    pub slots: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PromptPlanner;

impl PromptPlanner {
    pub fn plan(&self, context: &RetrievalContext, question: &str) -> PromptBuildPlan {
        let scene = Scene::select(&context.kb_context, &context.mcp_context);

        let base_template = match context.participating.as_slice() {
            [only] => only
                .prompt_template
                .as_deref()
                .filter(|t| !t.trim().is_empty())
                .map(str::to_string),
            _ => None,
        };

        let mut rules: Vec<String> = Vec::new();
        if base_template.is_none() {
            for node in &context.participating {
                if let Some(snippet) = node.prompt_snippet.as_deref().map(str::trim) {
                    if !snippet.is_empty() && !rules.iter().any(|r| r == snippet) {
                        rules.push(snippet.to_string());
                    }
                }
            }
        }

        let question = question.to_string();
        let slots = match scene {
            Scene::KbOnly => vec![context.kb_context.clone(), question],
            Scene::McpOnly => vec![context.mcp_context.clone(), question],
            Scene::Mixed => vec![context.mcp_context.clone(), context.kb_context.clone(), question],
            Scene::Empty => vec![question],
        };

        PromptBuildPlan {
            scene,
            base_template,
            rules,
            slots,
        }
    }

    pub fn render(&self, plan: &PromptBuildPlan) -> String {
        let template = match &plan.base_template {
            Some(custom) => custom.clone(),
            None => inject_rules(plan.scene.default_template(), &plan.rules),
        };
        collapse_newlines(&substitute(&template, &plan.slots)).trim().to_string()
    }

    pub fn build(&self, context: &RetrievalContext, question: &str) -> String {
        self.render(&self.plan(context, question))
    }
}

fn inject_rules(template: &str, rules: &[String]) -> String {
    let section = if rules.is_empty() {
        String::new()
    } else {
        format!("{}\n{}", INTENT_RULES_HEADER, rules.join("\n"))
    };

    if template.contains(INTENT_RULES_PLACEHOLDER) {
        template.replace(INTENT_RULES_PLACEHOLDER, &section)
    } else if section.is_empty() {
        template.to_string()
    } else {
        format!("{}\n\n{}", section, template)
    }
}

/// Replace each `%s` in order. Substituted text is not rescanned; missing
/// slots render empty.
fn substitute(template: &str, slots: &[String]) -> String {
    let mut out = String::with_capacity(template.len() + slots.iter().map(String::len).sum::<usize>());
    let mut slots = slots.iter();
    let mut pieces = template.split("%s");
    if let Some(first) = pieces.next() {
        out.push_str(first);
    }
    for piece in pieces {
        if let Some(slot) = slots.next() {
            out.push_str(slot);
        }
        out.push_str(piece);
    }
    out
}

/// Runs of three or more newlines become exactly two
fn collapse_newlines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run = 0;
    for c in text.chars() {
        if c == '\n' {
            run += 1;
            if run <= 2 {
                out.push(c);
            }
        } else {
            run = 0;
            out.push(c);
        }
    }
    out
}
