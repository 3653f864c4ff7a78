//! Deterministic split of a TDD plan into per-section documents.
//!
//! A section starts at every level-two heading (`## `) outside fenced code blocks.
//! Text before the first heading is a shared preamble copied into every document.

/// One document produced from a plan section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanDocument {
    pub title: String,
    pub file_name: String,
    pub body: String,
}

pub fn split_plan(plan: &str) -> Vec<PlanDocument> {
    let mut preamble = String::new();
    let mut sections: Vec<(String, String)> = Vec::new();
    let mut in_fence = false;

    for line in plan.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        let heading = (!in_fence)
            .then(|| line.strip_prefix("## "))
            .flatten()
            .map(str::trim)
            .filter(|title| !title.is_empty());
        match (heading, sections.last_mut()) {
            (Some(title), _) => sections.push((title.to_string(), format!("{line}\n"))),
            (None, Some((_, body))) => {
                body.push_str(line);
                body.push('\n');
            }
            (None, None) => {
                preamble.push_str(line);
                preamble.push('\n');
            }
        }
    }

    if sections.is_empty() {
        let title = first_title(plan).unwrap_or_else(|| "Plan".to_string());
        return vec![PlanDocument {
            file_name: file_name(0, &title),
            title,
            body: ensure_trailing_newline(plan.trim()),
        }];
    }

    let preamble = preamble.trim();
    sections
        .into_iter()
        .enumerate()
        .map(|(idx, (title, body))| {
            let body = if preamble.is_empty() {
                ensure_trailing_newline(body.trim())
            } else {
                ensure_trailing_newline(&format!("{preamble}\n\n{}", body.trim()))
            };
            PlanDocument {
                file_name: file_name(idx, &title),
                title,
                body,
            }
        })
        .collect()
}

/// Filesystem-safe slug: lowercase ascii alphanumerics joined by single dashes.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
        if slug.len() >= 48 {
            break;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "part".to_string()
    } else {
        slug
    }
}

fn file_name(idx: usize, title: &str) -> String {
    format!("{:02}-{}.md", idx + 1, slugify(title))
}

fn first_title(plan: &str) -> Option<String> {
    plan.lines()
        .filter_map(|line| line.strip_prefix("# "))
        .map(str::trim)
        .find(|title| !title.is_empty())
        .map(str::to_string)
}

fn ensure_trailing_newline(text: &str) -> String {
    let mut out = text.to_string();
    out.push('\n');
    out
}
