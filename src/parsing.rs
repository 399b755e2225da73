//! Parsing utilities for language-model responses.
//!
//! Every extraction the pipeline performs on model output lives here, each
//! with a declared grammar and a typed failure instead of best-effort
//! guessing. Stages turn a [`ParseError`] into
//! [`PipelineError::MalformedResponse`](crate::PipelineError::MalformedResponse)
//! with the raw output attached.

/// Reasoning-trace delimiter pairs some backends emit before the answer.
const THINK_TAGS: &[(&str, &str)] = &[("<think>", "</think>"), ("<thinking>", "</thinking>")];

/// Lines starting with one of these (case-insensitive, after trimming) are
/// page headings, not page content.
const PAGE_MARKERS: &[&str] = &["**seite"];

/// Each line is cut at the first occurrence of any of these separators.
const SEPARATORS: &[&str] = &["---", "***", "###", "■■■"];

/// Lines containing one of these (case-insensitive) are the model explaining
/// its own writing.
const META_KEYWORDS: &[&str] = &[
    "diese seite",
    "ziel",
    "soll",
    "darauf",
    "ist darauf ausgelegt",
    "hilft",
    "verständlichkeit",
];

/// Errors returned by the response parsers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Nothing usable was left after preprocessing.
    #[error("empty response")]
    Empty,

    /// No `[` ... `]` pair was found.
    #[error("no bracket-delimited list found")]
    NoList,

    /// A bracketed substring was found but is not a list of strings.
    #[error("bracketed text is not a list of strings: {0}")]
    InvalidList(String),

    /// The list parsed but holds no non-empty entries.
    #[error("list contains no entries")]
    EmptyList,

    /// No line of the form `N. text` was found.
    #[error("no numbered outline lines found")]
    NoNumberedLines,
}

/// Remove reasoning-trace blocks from a raw completion.
///
/// If the text contains an opening marker, everything up to and including
/// the matching closing marker is discarded and only what follows is kept.
/// An unterminated block swallows the rest of the text. Repeated blocks are
/// all removed.
///
/// Returns `(thinking, remainder)`; `thinking` joins the trace contents.
///
/// ```
/// use storybook_pipeline::parsing::strip_think_tags;
///
/// let (thinking, text) = strip_think_tags("<think>plan the title</think>Die Waldfreunde");
/// assert_eq!(thinking.as_deref(), Some("plan the title"));
/// assert_eq!(text, "Die Waldfreunde");
/// ```
pub fn strip_think_tags(text: &str) -> (Option<String>, String) {
    let mut rest = text;
    let mut traces: Vec<&str> = Vec::new();

    loop {
        let next = THINK_TAGS
            .iter()
            .filter_map(|(open, close)| rest.find(open).map(|idx| (idx, *open, *close)))
            .min_by_key(|(idx, _, _)| *idx);

        let Some((start, open, close)) = next else {
            break;
        };

        let body_start = start + open.len();
        match rest[body_start..].find(close) {
            Some(offset) => {
                traces.push(&rest[body_start..body_start + offset]);
                rest = &rest[body_start + offset + close.len()..];
            }
            None => {
                traces.push(&rest[body_start..]);
                rest = "";
                break;
            }
        }
    }

    let thinking = traces
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    let thinking = if thinking.is_empty() {
        None
    } else {
        Some(thinking)
    };
    (thinking, rest.to_string())
}

/// Extract a list of strings from a response that may carry commentary.
///
/// Grammar: the substring from the first `[` to the last `]` (inclusive)
/// must be a JSON array of strings. Entries are trimmed; empty entries are
/// dropped.
///
/// ```
/// use storybook_pipeline::parsing::extract_bracket_list;
///
/// let topics = extract_bracket_list(r#"Here are three ideas: ["Drachen", "Weltraum", "Tiere"]"#).unwrap();
/// assert_eq!(topics, vec!["Drachen", "Weltraum", "Tiere"]);
/// ```
pub fn extract_bracket_list(text: &str) -> Result<Vec<String>, ParseError> {
    let start = text.find('[').ok_or(ParseError::NoList)?;
    let end = text.rfind(']').ok_or(ParseError::NoList)?;
    if end < start {
        return Err(ParseError::NoList);
    }

    let items: Vec<String> = serde_json::from_str(&text[start..=end])
        .map_err(|e| ParseError::InvalidList(e.to_string()))?;

    let items: Vec<String> = items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if items.is_empty() {
        return Err(ParseError::EmptyList);
    }
    Ok(items)
}

/// Parse the beats of a numbered outline.
///
/// Grammar: a beat is a line of the form `N. text` or `N) text`, optionally
/// wrapped in markdown emphasis or heading markers (`**1.** text`,
/// `### 2. text`). Other lines are ignored.
pub fn parse_outline(text: &str) -> Result<Vec<String>, ParseError> {
    let beats: Vec<String> = text.lines().filter_map(parse_numbered_line).collect();
    if beats.is_empty() {
        return Err(ParseError::NoNumberedLines);
    }
    Ok(beats)
}

fn parse_numbered_line(line: &str) -> Option<String> {
    let line = line.trim().trim_start_matches(['*', '#', ' ']);
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let rest = &line[digits..];
    let rest = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')'))?;
    let beat = rest.trim_start_matches('*').trim();
    if beat.is_empty() {
        None
    } else {
        Some(beat.to_string())
    }
}

/// Split a character-roster response into one entry per non-empty line.
pub fn parse_character_roster(text: &str) -> Result<Vec<String>, ParseError> {
    let roster: Vec<String> = text
        .trim()
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if roster.is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(roster)
}

/// Strip surrounding quotes, asterisks and whitespace from a generated title.
///
/// ```
/// use storybook_pipeline::parsing::clean_title;
///
/// assert_eq!(clean_title("**Die Waldfreunde**\n"), "Die Waldfreunde");
/// ```
pub fn clean_title(text: &str) -> String {
    text.trim_matches(|c: char| c == '"' || c == '*' || c.is_whitespace())
        .to_string()
}

/// Remove model "leakage" from a page-text response.
///
/// 1. Drop lines that begin with a page-number marker.
/// 2. Cut every line at the first occurrence of each separator marker.
/// 3. Drop lines containing meta-commentary keywords.
///
/// The result is re-joined with newlines and trimmed. Applying the function
/// to its own output changes nothing.
///
/// ```
/// use storybook_pipeline::parsing::clean_page_text;
///
/// let raw = "Es war einmal ein Fuchs.\n**Seite 3**\nDiese Seite hilft Kindern beim Verständnis.";
/// assert_eq!(clean_page_text(raw), "Es war einmal ein Fuchs.");
/// ```
pub fn clean_page_text(text: &str) -> String {
    let lines = text
        .trim()
        .lines()
        .filter(|line| {
            let lower = line.trim().to_lowercase();
            !PAGE_MARKERS.iter().any(|m| lower.starts_with(m))
        })
        .map(|line| {
            let mut line = line;
            for sep in SEPARATORS {
                if let Some(idx) = line.find(sep) {
                    line = &line[..idx];
                }
                line = line.trim();
            }
            line
        })
        .filter(|line| {
            let lower = line.to_lowercase();
            !META_KEYWORDS.iter().any(|k| lower.contains(k))
        })
        .collect::<Vec<_>>();

    lines.join("\n").trim().to_string()
}
