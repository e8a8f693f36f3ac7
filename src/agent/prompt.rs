//! Prompt assembly for agent invocations.
//!
//! The template file provides the scaffolding; this module only does token
//! substitution: `{{datetime}}`, `{{source}}`, `{{assistant_context}}`,
//! `{{user_input}}`.

use chrono::Local;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::PROMPT_TEMPLATE_PATH;
use crate::events::FileDescriptor;

use super::AgentSource;

/// Author ids are Discord snowflakes; the progress hint only applies to
/// real DM authors.
static AUTHOR_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{17,20}$").unwrap());

/// Used when a message carries attachments but no text.
const EMPTY_INPUT_PLACEHOLDER: &str = "(the message had no text content)";

const DEFAULT_TEMPLATE: &str = "\
Current time: {{datetime}}
Request source: {{source}}
{{assistant_context}}
{{user_input}}
";

const DM_PROGRESS_HINT: &str = "\
You are answering a Discord direct message. The user sees your full reply \
once you finish; keep it focused, and prefer plain text over heavy markup.";

pub struct PromptContext<'a> {
    pub source: AgentSource,
    pub author_id: Option<&'a str>,
    pub attachments: &'a [FileDescriptor],
    pub user_input: &'a str,
}

/// Render the prompt template for one invocation.
pub async fn render(ctx: &PromptContext<'_>) -> anyhow::Result<String> {
    let template = match tokio::fs::read_to_string(PROMPT_TEMPLATE_PATH).await {
        Ok(content) => content,
        Err(_) => DEFAULT_TEMPLATE.to_string(),
    };
    Ok(substitute(&template, ctx))
}

fn substitute(template: &str, ctx: &PromptContext<'_>) -> String {
    let user_input = {
        let trimmed = ctx.user_input.trim();
        if trimmed.is_empty() {
            EMPTY_INPUT_PLACEHOLDER.to_string()
        } else {
            trimmed.to_string()
        }
    };

    template
        .replace("{{datetime}}", &Local::now().format("%Y-%m-%d %H:%M").to_string())
        .replace("{{source}}", ctx.source.as_str())
        .replace("{{assistant_context}}", &assistant_context(ctx))
        .replace("{{user_input}}", &user_input)
}

fn assistant_context(ctx: &PromptContext<'_>) -> String {
    let mut blocks = Vec::new();

    let is_dm_author = ctx.source == AgentSource::Dm
        && ctx.author_id.is_some_and(|id| AUTHOR_ID_RE.is_match(id));
    if is_dm_author {
        blocks.push(DM_PROGRESS_HINT.to_string());
    }

    if !ctx.attachments.is_empty() {
        let mut lines = vec!["The user attached files, saved at:".to_string()];
        for file in ctx.attachments {
            lines.push(format!("- {} ({})", file.path, file.name));
        }
        blocks.push(lines.join("\n"));
    }

    blocks.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(source: AgentSource, author: Option<&'a str>, input: &'a str) -> PromptContext<'a> {
        PromptContext {
            source,
            author_id: author,
            attachments: &[],
            user_input: input,
        }
    }

    #[test]
    fn substitutes_all_tokens() {
        let rendered = substitute(
            DEFAULT_TEMPLATE,
            &ctx(AgentSource::Dm, Some("123456789012345678"), "hello"),
        );
        assert!(!rendered.contains("{{"));
        assert!(rendered.contains("Request source: dm"));
        assert!(rendered.contains("hello"));
        assert!(rendered.contains("direct message"));
    }

    #[test]
    fn progress_hint_requires_dm_source_and_snowflake_author() {
        let scheduler = substitute(
            DEFAULT_TEMPLATE,
            &ctx(AgentSource::Scheduler, Some("123456789012345678"), "x"),
        );
        assert!(!scheduler.contains("direct message"));

        let short_author = substitute(DEFAULT_TEMPLATE, &ctx(AgentSource::Dm, Some("123"), "x"));
        assert!(!short_author.contains("direct message"));

        let no_author = substitute(DEFAULT_TEMPLATE, &ctx(AgentSource::Dm, None, "x"));
        assert!(!no_author.contains("direct message"));
    }

    #[test]
    fn empty_input_becomes_placeholder() {
        let rendered = substitute(DEFAULT_TEMPLATE, &ctx(AgentSource::Dm, None, "   "));
        assert!(rendered.contains(EMPTY_INPUT_PLACEHOLDER));
    }

    #[test]
    fn attachment_block_lists_paths() {
        let files = vec![FileDescriptor {
            path: "tmp/cc-discord-bot/attachments/42/a.png".to_string(),
            name: "a.png".to_string(),
        }];
        let ctx = PromptContext {
            source: AgentSource::Dm,
            author_id: None,
            attachments: &files,
            user_input: "look at this",
        };
        let rendered = substitute(DEFAULT_TEMPLATE, &ctx);
        assert!(rendered.contains("attachments/42/a.png"));
        assert!(rendered.contains("(a.png)"));
    }
}
