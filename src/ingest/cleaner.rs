//! Text cleaning and normalization applied between extraction and chunking.
//!
//! The minimum-invariant pass (control bytes, U+FFFE, `<|`/`|>` rewriting)
//! always runs, even when a space disables every configurable rule. The
//! whitespace and URL/email rules are opt-in per space.

use once_cell::sync::Lazy;
use regex::Regex;

static CONTROL_CHARS: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F\u{FFFE}]").expect("control char pattern"));

static EXCESS_NEWLINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("newline pattern"));

// Tab, form feed, carriage return, space, plus the Unicode space family
// (NBSP, Ogham, Mongolian separator, en/em spaces, narrow NBSP, math space,
// ideographic space).
static EXCESS_SPACES: Lazy<Regex> = Lazy::new(|| {
  Regex::new(r"[\t\x0C\r \u{00A0}\u{1680}\u{180E}\u{2000}-\u{200A}\u{202F}\u{205F}\u{3000}]{2,}")
    .expect("space pattern")
});

static EMAIL: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"[a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9-.]+").expect("email pattern"));

static MARKDOWN_LINK: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"\[([^\]]*)\]\((https?://[^)]+)\)").expect("markdown link pattern"));

static MARKDOWN_IMAGE: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"!\[.*?\]\((https?://[^)]+)\)").expect("markdown image pattern"));

static RAW_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").expect("url pattern"));

/// Configurable cleaning rules. The defaults match the automatic ingestion
/// path: collapse whitespace, keep URLs and emails.
#[derive(Debug, Clone, Copy)]
pub struct CleanRules {
  pub remove_extra_spaces: bool,
  pub remove_urls_emails: bool,
}

impl Default for CleanRules {
  fn default() -> Self {
    Self {
      remove_extra_spaces: true,
      remove_urls_emails: false,
    }
  }
}

impl CleanRules {
  /// The minimum-invariant ruleset: only the always-on pass runs.
  pub fn minimal() -> Self {
    Self {
      remove_extra_spaces: false,
      remove_urls_emails: false,
    }
  }
}

/// Clean and normalize text. Deterministic: equal input and rules always
/// produce equal output.
pub fn clean(text: &str, rules: CleanRules) -> String {
  if text.is_empty() {
    return String::new();
  }

  // Always-on pass: rewrite <|...|> fences, strip control bytes and U+FFFE.
  let text = text.replace("<|", "<").replace("|>", ">");
  let mut text = CONTROL_CHARS.replace_all(&text, "").into_owned();

  if rules.remove_extra_spaces {
    text = EXCESS_NEWLINES.replace_all(&text, "\n\n").into_owned();
    text = EXCESS_SPACES.replace_all(&text, " ").into_owned();
  }

  if rules.remove_urls_emails {
    text = strip_urls_and_emails(&text);
  }

  text
}

/// Remove emails and raw URLs while preserving markdown links and images.
///
/// Markdown constructs are masked with placeholders before the raw-URL strip
/// and restored afterwards, so `[text](https://…)` survives intact.
fn strip_urls_and_emails(text: &str) -> String {
  let mut text = EMAIL.replace_all(text, "").into_owned();

  let mut placeholders: Vec<String> = Vec::new();

  // Protect markdown links first, then images.
  text = MARKDOWN_LINK
    .replace_all(&text, |caps: &regex::Captures<'_>| {
      let placeholder = format!("__MARKDOWN_PLACEHOLDER_{}__", placeholders.len());
      placeholders.push(format!("[{}]({})", &caps[1], &caps[2]));
      placeholder
    })
    .into_owned();

  text = MARKDOWN_IMAGE
    .replace_all(&text, |caps: &regex::Captures<'_>| {
      let placeholder = format!("__MARKDOWN_PLACEHOLDER_{}__", placeholders.len());
      placeholders.push(format!("![image]({})", &caps[1]));
      placeholder
    })
    .into_owned();

  text = RAW_URL.replace_all(&text, "").into_owned();

  for (i, restored) in placeholders.iter().enumerate() {
    text = text.replace(&format!("__MARKDOWN_PLACEHOLDER_{i}__"), restored);
  }

  text
}
