//! Prompt templates and the placeholder renderer.
//!
//! Text prompts are German (the books are German); the illustration prompt is
//! English because the diffusion models are. Templates use `{key}`
//! placeholders filled by [`render`].

use std::collections::HashMap;

/// Editorial persona asking for three topical book ideas as a list literal.
pub const TOPIC_PROMPT: &str = r#"Du bist Paul, ein erfahrener Kinderbuchredakteur in einem großen Verlag.
Du kennst die aktuellen Interessen von Kindern im Alter von 4–8 Jahren sehr gut, weil du regelmäßig Kinderzeitschriften liest, Spielzeugkataloge durchgehst und mit Eltern, Lehrer:innen und Kindern sprichst.

Welche drei Themen sind im Moment besonders beliebt und eignen sich gut als kreative Kinderbuchideen?

Gib deine Antwort als JSON-Liste mit genau drei kindgerechten Buchtiteln zurück:

["Titel 1", "Titel 2", "Titel 3"]
"#;

pub const TITLE_TEMPLATE: &str = r#"Du bist ein kreativer Kinderbuchautor.
Welchen passenden Titel würdest du einem illustrierten Kinderbuch zum Thema "{theme}" geben?
Der Titel soll neugierig machen, kindgerecht sein und zur Altersgruppe 4–8 passen. Gib nur den Titel zurück.
"#;

pub const OUTLINE_TEMPLATE: &str = r#"Du bist ein Kinderbuchautor und schreibst ein kurzes illustriertes Buch für Kinder im Alter von 4–8 Jahren.
Das Thema lautet: "{theme}"
Erstelle eine kurze Gliederung für eine Geschichte zu diesem Thema.
Folge dabei dieser Struktur:
1 Seite Einführung,
1 Seite Problem/Konflikt,
2 Seiten steigende Handlung,
1 Seite Höhepunkt,
1 Seite Auflösung,
1 Seite Schluss.

Die Geschichte soll kindgerecht, einfach und gut illustrierbar sein.
Jeder Schritt soll aus 1–2 kurzen Sätzen bestehen.
Gib die Gliederung als nummerierte Liste zurück (z.B. 1. ..., 2. ..., usw.). Schreibe noch nicht den vollständigen Text der Geschichte.
"#;

pub const CHARACTER_TEMPLATE: &str = r#"You are a children's book author and illustrator.
You are working on a short picture book for ages 4–8, with the theme "{theme}".
Define 1–3 recurring characters for the story.

For each character, briefly describe:
- Name
- Role in the story
- Appearance (age, clothes, colors, special traits)
- Personality

Make the descriptions consistent and suitable for illustrations.
Return as a list.
Mind that this will be included in all image descriptions, so keep it very short and efficient.
"#;

pub const PAGE_TEXT_TEMPLATE: &str = r#"Du schreibst ein Kinderbuch mit dem Titel "{title}" zum Thema "{theme}".
Die geplante Gliederung der Geschichte lautet:

```

{outline}

```

Schreibe den endgültigen Text für Seite {index}, basierend auf dem entsprechenden Punkt in der Gliederung.
Schreibe 1–3 kurze Sätze, die für Kinder im Alter von 4–8 Jahren geeignet sind.
Verwende eine einfache, verständliche Sprache.
Gib ausschließlich den eigentlichen Text für die Kinderbuchseite zurück – ohne Überschrift, Seitennummer, Kommentare oder Erklärungen.
Nur den Text, der im Buch abgedruckt wird.
"#;

pub const ILLUSTRATION_TEMPLATE: &str = r#"You are a children's book illustrator. You are working on the book "{title}" (Theme: {theme}).
The text generated so far is:

```

{content}

```

Briefly describe what should be shown in the illustration for page {index}, in the form of a prompt for text-to-image generation.
Maintain consistency with the previously described content, characters, and illustrations.
The text on the page is: {text}
Take into account what is typically appropriate for children's books (e.g., bright colors, clear scenes).
Return only the english image description.
Mind that you only have 77 tokens for your entire response so write super short efficient prompts!
"#;

pub const COVER_TEMPLATE: &str = "Make a cover for a children's book with this title: {title}";

/// Named values substituted into a template.
#[derive(Debug, Clone, Default)]
pub struct PromptVars {
    data: HashMap<String, String>,
}

impl PromptVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable (builder style).
    pub fn insert(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.data.insert(key.into(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }
}

/// Render a template in a single left-to-right pass.
///
/// `{key}` is replaced by the value of `key`. Substituted values are never
/// re-scanned, so braces inside a value are copied verbatim. `{{` and `}}`
/// produce literal braces. Placeholders without a value are left as written.
///
/// # Example
///
/// ```
/// use storybook_pipeline::prompt::{render, PromptVars};
///
/// let vars = PromptVars::new().insert("name", "Fini");
/// let out = render("Hallo {name}, JSON: {{\"a\": 1}} {unknown}", &vars);
/// assert_eq!(out, r#"Hallo Fini, JSON: {"a": 1} {unknown}"#);
/// ```
pub fn render(template: &str, vars: &PromptVars) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(idx) = rest.find(['{', '}']) {
        out.push_str(&rest[..idx]);
        let tail = &rest[idx..];

        if tail.starts_with("{{") {
            out.push('{');
            rest = &tail[2..];
        } else if tail.starts_with("}}") {
            out.push('}');
            rest = &tail[2..];
        } else if tail.starts_with('{') {
            match placeholder_key(tail).and_then(|key| vars.get(key).map(|v| (key, v))) {
                Some((key, value)) => {
                    out.push_str(value);
                    rest = &tail[key.len() + 2..];
                }
                None => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        } else {
            out.push('}');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

/// The identifier between `{` and `}` at the start of `s`, if well formed.
fn placeholder_key(s: &str) -> Option<&str> {
    let body = s.strip_prefix('{')?;
    let end = body.find('}')?;
    let key = &body[..end];
    if !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Some(key)
    } else {
        None
    }
}

/// Create a numbered list from items (1-indexed).
pub fn numbered_list(items: &[String]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {}", i + 1, item))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn title_prompt(theme: &str) -> String {
    render(TITLE_TEMPLATE, &PromptVars::new().insert("theme", theme))
}

pub fn outline_prompt(theme: &str) -> String {
    render(OUTLINE_TEMPLATE, &PromptVars::new().insert("theme", theme))
}

pub fn character_prompt(theme: &str) -> String {
    render(CHARACTER_TEMPLATE, &PromptVars::new().insert("theme", theme))
}

/// Page-text prompt for the 1-based page `index`, embedding the full outline.
pub fn page_text_prompt(theme: &str, title: &str, outline: &str, index: usize) -> String {
    let vars = PromptVars::new()
        .insert("theme", theme)
        .insert("title", title)
        .insert("outline", outline)
        .insert("index", index);
    render(PAGE_TEXT_TEMPLATE, &vars)
}

/// Illustration-description prompt for the 1-based page `index`.
///
/// `prior_texts` are the finalized texts of pages `1..index`; the character
/// roster is prepended so every page sees the same cast.
pub fn illustration_prompt(
    theme: &str,
    title: &str,
    prior_texts: &[String],
    index: usize,
    text: &str,
    characters: &[String],
) -> String {
    let vars = PromptVars::new()
        .insert("theme", theme)
        .insert("title", title)
        .insert("content", numbered_list(prior_texts))
        .insert("index", index)
        .insert("text", text);
    format!(
        "The main characters in this book are:\n{}\n\n{}",
        characters.join("\n"),
        render(ILLUSTRATION_TEMPLATE, &vars)
    )
}

pub fn cover_prompt(title: &str) -> String {
    render(COVER_TEMPLATE, &PromptVars::new().insert("title", title))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_basic() {
        let vars = PromptVars::new().insert("name", "Fini").insert("n", 3);
        assert_eq!(render("Hallo {name}, Seite {n}", &vars), "Hallo Fini, Seite 3");
    }

    #[test]
    fn test_render_no_placeholders() {
        assert_eq!(render("static prompt", &PromptVars::new()), "static prompt");
    }

    #[test]
    fn test_render_escaped_braces() {
        let vars = PromptVars::new().insert("name", "Fini");
        let result = render("Hello {name}, JSON: {{\"key\": \"val\"}}", &vars);
        assert_eq!(result, r#"Hello Fini, JSON: {"key": "val"}"#);
    }

    #[test]
    fn test_render_values_are_not_rescanned() {
        let vars = PromptVars::new()
            .insert("text", "Fini sagt {title} und {{")
            .insert("title", "NICHT");
        assert_eq!(render("[{text}]", &vars), "[Fini sagt {title} und {{]");
    }

    #[test]
    fn test_render_unknown_and_malformed_left_verbatim() {
        let vars = PromptVars::new().insert("a", "x");
        assert_eq!(render("{b} {a} { a } {", &vars), "{b} x { a } {");
        assert_eq!(render("lone } brace", &vars), "lone } brace");
    }

    #[test]
    fn test_numbered_list() {
        let items = vec!["First".to_string(), "Second".to_string()];
        assert_eq!(numbered_list(&items), "1. First\n2. Second");
        assert_eq!(numbered_list(&[]), "");
    }

    #[test]
    fn test_topic_prompt_shows_list_literal() {
        let rendered = render(TOPIC_PROMPT, &PromptVars::new());
        assert!(rendered.contains(r#"["Titel 1", "Titel 2", "Titel 3"]"#));
        assert!(rendered.contains("Paul"));
    }

    #[test]
    fn test_page_text_prompt_embeds_outline_and_index() {
        let prompt = page_text_prompt("Freundschaft im Wald", "Die Waldfreunde", "1. A\n2. B", 4);
        assert!(prompt.contains("\"Die Waldfreunde\""));
        assert!(prompt.contains("\"Freundschaft im Wald\""));
        assert!(prompt.contains("1. A\n2. B"));
        assert!(prompt.contains("Seite 4"));
    }

    #[test]
    fn test_illustration_prompt_prefix_and_prior_texts() {
        let prior = vec!["Es war einmal.".to_string(), "Ein Sturm kam.".to_string()];
        let roster = vec!["- Fini, Fuchs".to_string(), "- Hops, Hase".to_string()];
        let prompt = illustration_prompt("Wald", "Titel", &prior, 3, "Sie fanden eine Höhle.", &roster);
        assert!(prompt.starts_with("The main characters in this book are:\n- Fini, Fuchs\n- Hops, Hase\n\n"));
        assert!(prompt.contains("1. Es war einmal.\n2. Ein Sturm kam."));
        assert!(prompt.contains("illustration for page 3"));
        assert!(prompt.contains("The text on the page is: Sie fanden eine Höhle."));
    }

    #[test]
    fn test_cover_prompt() {
        assert_eq!(
            cover_prompt("Die Waldfreunde"),
            "Make a cover for a children's book with this title: Die Waldfreunde"
        );
    }
}
