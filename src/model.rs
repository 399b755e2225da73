use serde::{Deserialize, Serialize};

/// Number of pages in every storyline: intro, conflict, two rising-action
/// pages, climax, resolution, closing.
pub const PAGE_COUNT: usize = 7;

/// The root aggregate of a run, persisted as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Text-generation model; fixed when the run is created.
    pub model: String,

    /// Rendering profile key (e.g. `"sdxl"`).
    pub image_model: String,

    /// Candidate themes; written once by topic suggestion.
    #[serde(default)]
    pub suggested_topics: Option<Vec<String>>,

    /// Chosen theme; immutable once set.
    #[serde(default)]
    pub selected_topic: Option<String>,

    #[serde(default)]
    pub storyline: Option<Storyline>,
}

impl State {
    pub fn new(model: impl Into<String>, image_model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            image_model: image_model.into(),
            suggested_topics: None,
            selected_topic: None,
            storyline: None,
        }
    }

    /// The chosen topic, if it is set and not blank.
    pub fn topic(&self) -> Option<&str> {
        self.selected_topic
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// Generated narrative content of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Storyline {
    pub title: String,

    /// Rendered cover image; absent until rendering runs.
    #[serde(default)]
    pub title_image_filepath: Option<String>,

    /// Exactly [`PAGE_COUNT`] pages, in reading order.
    pub pages: Vec<Page>,

    /// The outline exactly as generated, re-embedded in every page prompt.
    #[serde(default)]
    pub outline: String,

    /// Recurring character descriptions used for every illustration prompt.
    #[serde(default)]
    pub characters: Vec<String>,
}

impl Storyline {
    /// Whether the cover and every page have a rendered image.
    pub fn all_images_present(&self) -> bool {
        self.title_image_filepath.is_some() && self.pages.iter().all(|p| p.image_filepath.is_some())
    }

    /// 0-based indices of pages without an image.
    pub fn pending_pages(&self) -> Vec<usize> {
        self.pages
            .iter()
            .enumerate()
            .filter(|(_, p)| p.image_filepath.is_none())
            .map(|(i, _)| i)
            .collect()
    }
}

/// One page of the book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub text: String,

    /// English prompt for the illustration.
    pub image_description: String,

    #[serde(default)]
    pub image_filepath: Option<String>,
}

impl Page {
    pub fn new(text: impl Into<String>, image_description: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image_description: image_description.into(),
            image_filepath: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storyline() -> Storyline {
        Storyline {
            title: "Die Waldfreunde".into(),
            title_image_filepath: None,
            pages: (1..=PAGE_COUNT)
                .map(|i| Page::new(format!("Text {i}"), format!("Scene {i}")))
                .collect(),
            outline: String::new(),
            characters: Vec::new(),
        }
    }

    #[test]
    fn test_topic_ignores_blank() {
        let mut state = State::new("llama3.1:8b", "sdxl");
        assert!(state.topic().is_none());
        state.selected_topic = Some("   ".into());
        assert!(state.topic().is_none());
        state.selected_topic = Some(" Drachen ".into());
        assert_eq!(state.topic(), Some("Drachen"));
    }

    #[test]
    fn test_pending_pages_and_all_images_present() {
        let mut s = storyline();
        assert_eq!(s.pending_pages(), (0..PAGE_COUNT).collect::<Vec<_>>());
        for (i, p) in s.pages.iter_mut().enumerate() {
            p.image_filepath = Some(format!("page_{i:02}.png"));
        }
        assert!(s.pending_pages().is_empty());
        assert!(!s.all_images_present());
        s.title_image_filepath = Some("title.png".into());
        assert!(s.all_images_present());
    }

    #[test]
    fn test_loads_record_without_outline_or_characters() {
        let json = r#"{
            "model": "phi4",
            "image_model": "sd35",
            "suggested_topics": ["Drachen"],
            "selected_topic": "Drachen",
            "storyline": {
                "title": "T",
                "title_image_filepath": null,
                "pages": [{"text": "a", "image_description": "b", "image_filepath": null}]
            }
        }"#;
        let state: State = serde_json::from_str(json).unwrap();
        let storyline = state.storyline.unwrap();
        assert!(storyline.outline.is_empty());
        assert!(storyline.characters.is_empty());
        assert_eq!(storyline.pages[0].text, "a");
    }

    #[test]
    fn test_json_round_trip() {
        let mut state = State::new("qwen3:14b", "sdxl");
        state.suggested_topics = Some(vec!["Drachen".into(), "Weltraum".into(), "Tiere".into()]);
        state.selected_topic = Some("Weltraum".into());
        let mut s = storyline();
        s.outline = "1. Start\n2. Ende".into();
        s.characters = vec!["- Luna, Astronautin".into()];
        s.pages[3].image_filepath = Some("runs/x/page_03.png".into());
        state.storyline = Some(s);

        let json = serde_json::to_string_pretty(&state).unwrap();
        let back: State = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
