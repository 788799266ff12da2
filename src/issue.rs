//! Issue model and the naming helpers derived from it.
//!
//! Issues are deserialized straight from `gh ... --json` payloads; the `repo`
//! field is not part of the JSON and is stamped on by the fetching side.

use serde::Deserialize;

/// Marker appended to every comment the bot posts. Invisible in rendered
/// markdown, stable across restarts, and unlikely to appear in user text.
pub const BOT_MARKER: &str = "<!-- claude-bot -->";

/// Leading text of every error comment. Counting occurrences across an
/// issue's comments yields the retry counter.
pub const ERROR_SENTINEL: &str = "claude-bot encountered an error:";

/// Trailer of the greeting comment. Distinct from [`BOT_MARKER`] so the
/// greeting step can recognize a prior greeting among other bot comments.
pub const GREETING_SIGNATURE: &str = "\n\n---\n*🤖 claude-bot is working on this*";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Issue {
    #[serde(skip)]
    pub repo: String,
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub author: Author,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Author {
    #[serde(default)]
    pub login: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    #[serde(default)]
    pub author: Author,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub created_at: String,
}

impl Issue {
    /// Canonical key: `owner/repo#number`.
    pub fn key(&self) -> String {
        format!("{}#{}", self.repo, self.number)
    }

    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l.name == name)
    }

    /// Number of prior error comments, recomputed from remote state.
    pub fn count_bot_errors(&self) -> usize {
        self.comments
            .iter()
            .filter(|c| c.body.contains(ERROR_SENTINEL))
            .count()
    }

    /// Whether any comment carries the bot marker.
    pub fn has_bot_comment(&self) -> bool {
        self.comments.iter().any(|c| c.body.contains(BOT_MARKER))
    }
}

/// Lowercase, collapse non-alphanumeric runs to single dashes, trim dashes,
/// cap at 50 characters.
pub fn slugify(s: &str) -> String {
    let mut slug = String::with_capacity(s.len());
    let mut pending_dash = false;
    for c in s.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    slug.truncate(50);
    slug
}

/// Branch for an issue: `issue-<n>-<slug(title)>`, with `fix` standing in for
/// an empty slug. Deterministic in `(number, title)`.
pub fn branch_name(issue: &Issue) -> String {
    let mut slug = slugify(&issue.title);
    if slug.is_empty() {
        slug = "fix".to_string();
    }
    format!("issue-{}-{}", issue.number, slug)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue_with_comments(bodies: &[&str]) -> Issue {
        Issue {
            comments: bodies
                .iter()
                .map(|b| Comment {
                    body: b.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_slugify() {
        let cases = [
            ("Fix URI Parsing!!", "fix-uri-parsing"),
            ("add CORS headers", "add-cors-headers"),
            ("", ""),
            ("a", "a"),
            ("--weird--title--", "weird-title"),
        ];
        for (input, want) in cases {
            assert_eq!(slugify(input), want, "slugify({input:?})");
        }
    }

    #[test]
    fn test_slugify_truncates_to_50() {
        let long = "x".repeat(100);
        assert_eq!(slugify(&long), "x".repeat(50));
    }

    #[test]
    fn test_slugify_idempotent() {
        for input in ["Fix URI Parsing!!", "a--b", "", "x y z"] {
            let once = slugify(input);
            assert_eq!(slugify(&once), once);
        }
    }

    #[test]
    fn test_branch_name() {
        let issue = Issue {
            number: 42,
            title: "Fix URI parsing".to_string(),
            ..Default::default()
        };
        assert_eq!(branch_name(&issue), "issue-42-fix-uri-parsing");
    }

    #[test]
    fn test_branch_name_empty_title_falls_back_to_fix() {
        let issue = Issue {
            number: 1,
            ..Default::default()
        };
        assert_eq!(branch_name(&issue), "issue-1-fix");
    }

    #[test]
    fn test_issue_key() {
        let issue = Issue {
            repo: "owner/repo".to_string(),
            number: 42,
            ..Default::default()
        };
        assert_eq!(issue.key(), "owner/repo#42");
    }

    #[test]
    fn test_has_label() {
        let issue = Issue {
            labels: vec![
                Label {
                    name: "todo".to_string(),
                },
                Label {
                    name: "bug".to_string(),
                },
            ],
            ..Default::default()
        };
        assert!(issue.has_label("todo"));
        assert!(!issue.has_label("nope"));
    }

    #[test]
    fn test_count_bot_errors() {
        let issue = issue_with_comments(&[
            "please fix this",
            "claude-bot encountered an error:\n```\nsome error\n```\nNeeds manual attention.",
            "I added more context",
            "claude-bot encountered an error:\n```\nanother error\n```\nNeeds manual attention.",
        ]);
        assert_eq!(issue.count_bot_errors(), 2);
    }

    #[test]
    fn test_has_bot_comment() {
        // A user merely mentioning the bot is not a bot comment.
        let user = issue_with_comments(&["I love claude-bot!"]);
        assert!(!user.has_bot_comment());

        let bot = issue_with_comments(&[&format!("Hey thanks!\n\n{BOT_MARKER}")]);
        assert!(bot.has_bot_comment());

        assert!(!Issue::default().has_bot_comment());
    }

    #[test]
    fn test_issue_deserializes_gh_json() {
        let json = r#"{
            "number": 7,
            "title": "Broken build",
            "body": "It fails",
            "labels": [{"name": "todo"}],
            "url": "https://github.com/acme/svc/issues/7",
            "author": {"login": "alice"},
            "comments": [
                {"author": {"login": "bob"}, "body": "same here", "createdAt": "2025-01-01T00:00:00Z"}
            ]
        }"#;
        let issue: Issue = serde_json::from_str(json).unwrap();
        assert_eq!(issue.number, 7);
        assert_eq!(issue.author.login, "alice");
        assert_eq!(issue.comments[0].created_at, "2025-01-01T00:00:00Z");
        assert!(issue.has_label("todo"));
    }
}
