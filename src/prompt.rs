//! Prompt builders for the synthesis agent. Deterministic, no randomness.

use std::fmt::Write;

use crate::issue::Issue;

/// The fix-this-issue prompt: issue header, the comment conversation (omitted
/// when there is none), then the fixed instruction block.
pub fn build_prompt(issue: &Issue) -> String {
    let mut p = String::new();
    p.push_str("You are working on a codebase. Fix the following GitHub issue.\n\n");
    let _ = write!(
        p,
        "## Issue #{}: {}\n{}\n\n",
        issue.number, issue.title, issue.body
    );

    if !issue.comments.is_empty() {
        p.push_str("## Comments (conversation with the user):\n");
        for c in &issue.comments {
            let _ = write!(p, "**{}** ({}):\n{}\n\n", c.author.login, c.created_at, c.body);
        }
    }

    p.push_str(
        "## Instructions:\n\
         - Read CLAUDE.md in the repo root for project-specific instructions\n\
         - Understand the codebase before making changes\n\
         - Make minimal, focused changes that address the issue\n\
         - Run any existing tests and make sure they pass\n\
         - If you create new functionality, add tests\n\
         - Do NOT commit — just make the file changes\n",
    );

    p
}

/// The triage-reply prompt. The reply it produces is posted verbatim as a
/// comment, so the instructions forbid any bot self-identification.
pub fn triage_prompt(issue: &Issue) -> String {
    format!(
        "You are responding to a GitHub issue as a helpful project contributor. \
         Write a short, friendly, human-sounding reply. DO NOT say you are a bot. \
         DO NOT use phrases like \"I'm an AI\" or \"automated\". Just respond \
         naturally as if you're a person on the team who read their issue.\n\n\
         Issue title: {title}\n\
         Issue author: @{author}\n\
         Issue body:\n{body}\n\n\
         - If they asked a question, try to help or point them in the right direction.\n\
         - If they reported a bug, acknowledge it and ask for more details if the report is thin.\n\
         - If they requested a feature, acknowledge the idea.\n\
         - Keep it to 2-4 sentences max. Be warm but concise.\n\
         - End by letting them know a maintainer will look at this soon, and if it's \
         something actionable, it can be picked up for work.\n",
        title = issue.title,
        author = issue.author.login,
        body = issue.body,
    )
}

/// Fallback reply when the agent cannot compose one.
pub fn triage_fallback(author: &str) -> String {
    format!("Hey @{author}, thanks for raising this! A maintainer will take a look soon.")
}
