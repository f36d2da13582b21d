//! Markdown note parsing: frontmatter extraction, content normalization,
//! and insight classification.
//!
//! A note is any markdown file; an *Insight* is a note living under the
//! vault's `Insights/` folder. The frontmatter preamble is treated as an
//! opaque key/value map — the store later projects it onto the scalar-only
//! schema the vector index accepts.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;

pub const INSIGHTS_FOLDER: &str = "Insights";

/// A parsed note: body text with the frontmatter preamble split off.
#[derive(Debug, Clone, Default)]
pub struct ParsedNote {
    /// Body markdown, frontmatter stripped.
    pub content: String,
    /// Frontmatter key/value pairs, kept as loose JSON values.
    pub frontmatter: BTreeMap<String, serde_json::Value>,
}

/// Read and parse a note file.
///
/// Fails on unreadable files and on malformed frontmatter YAML; the bulk
/// reindex path collects these failures per document.
pub fn parse_note(path: &Path) -> Result<ParsedNote> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read note: {}", path.display()))?;
    parse_note_text(&raw).with_context(|| format!("Failed to parse note: {}", path.display()))
}

/// Parse raw note text into body and frontmatter.
pub fn parse_note_text(raw: &str) -> Result<ParsedNote> {
    let Some((yaml, body_start_line)) = frontmatter_block(raw) else {
        return Ok(ParsedNote {
            content: raw.to_string(),
            frontmatter: BTreeMap::new(),
        });
    };

    // An empty preamble parses as YAML null, not an empty map
    let frontmatter: BTreeMap<String, serde_json::Value> = if yaml.trim().is_empty() {
        BTreeMap::new()
    } else {
        serde_yaml::from_str(&yaml).context("Invalid frontmatter YAML")?
    };

    let content = raw
        .lines()
        .skip(body_start_line)
        .collect::<Vec<_>>()
        .join("\n")
        .trim_start_matches('\n')
        .to_string();

    Ok(ParsedNote {
        content,
        frontmatter,
    })
}

/// Locate a `---` delimited frontmatter block at the top of the text.
///
/// Returns the raw YAML and the line index where the body begins, or
/// `None` when the note has no preamble.
fn frontmatter_block(raw: &str) -> Option<(String, usize)> {
    let mut lines = raw.lines();
    if lines.next()?.trim_end() != "---" {
        return None;
    }

    let mut yaml_lines: Vec<&str> = Vec::new();
    for (i, line) in lines.enumerate() {
        let trimmed = line.trim_end();
        if trimmed == "---" || trimmed == "..." {
            // +2: the opening fence and this closing fence
            return Some((yaml_lines.join("\n"), i + 2));
        }
        yaml_lines.push(line);
    }

    // Unterminated fence: treat the whole text as body
    None
}

/// Relative path from the vault root, as the index keys documents.
///
/// Paths outside the vault fall back to their absolute form, matching the
/// behavior for files reported by the watcher before the vault moved.
pub fn relative_path(file_path: &Path, vault_path: &Path) -> String {
    file_path
        .strip_prefix(vault_path)
        .unwrap_or(file_path)
        .to_string_lossy()
        .to_string()
}

/// Folder-based classification: an Insight is a markdown file under the
/// `Insights/` folder. Purely path-based, so it also works for paths that
/// no longer exist on disk (deletions).
pub fn is_insight_note(file_path: &Path, vault_path: &Path) -> bool {
    let relative = relative_path(file_path, vault_path);
    relative.starts_with(&format!("{INSIGHTS_FOLDER}/"))
        && file_path.extension().and_then(|e| e.to_str()) == Some("md")
}

fn link_with_label() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\[([^\]|]+)\|([^\]]+)\]\]").unwrap())
}

fn bare_link() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\[([^\]]+)\]\]").unwrap())
}

/// Canonicalize note text for embedding and deduplication comparison.
///
/// Collapses all whitespace runs to single spaces, rewrites wiki links
/// (`[[target|label]]` → `label`, `[[target]]` → `target`), and trims.
/// Idempotent; whitespace-only input normalizes to the empty string.
pub fn normalize_content(content: &str) -> String {
    let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
    let labeled = link_with_label().replace_all(&collapsed, "$2");
    let plain = bare_link().replace_all(&labeled, "$1");
    plain.trim().to_string()
}
