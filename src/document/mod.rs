//! Document assembly: cover page plus one page per story page.
//!
//! Page layout (square, `size` points):
//!
//! ```text
//! ┌──────────────────────────┐
//! │                          │
//! │     image, fitted and    │
//! │     centered             │
//! │   ┌──────────────────┐   │
//! │   │ wrapped caption  │   │  60 % white rounded box
//! │   └──────────────────┘   │
//! └──────────────────────────┘
//! ```
//!
//! A missing image is drawn as an empty page area; assembly only fails when
//! there is no storyline or the output cannot be written.

pub mod pdf;

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::model::State;
use crate::store::write_atomic;
use crate::PipelineError;
use pdf::{ContentStream, EmbeddedImage, PdfWriter, FONT_BOLD, FONT_REGULAR};

const INCH: f32 = 72.0;

/// Caption style for story pages.
const PAGE_FONT_SIZE: f32 = 14.0;
const PAGE_WRAP: usize = 65;
const PAGE_PADDING: f32 = 12.0;

/// Caption style for the optional cover title.
const TITLE_FONT_SIZE: f32 = 28.0;
const TITLE_WRAP: usize = 25;
const TITLE_COLOR: (f32, f32, f32) = (0.2, 0.2, 0.9);

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutOptions {
    /// Edge length of the square pages in points.
    pub page_size: f32,
    /// Overlay the title on the cover.
    pub title_caption: bool,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            page_size: 8.0 * INCH,
            title_caption: false,
        }
    }
}

impl From<&crate::config::DocumentConfig> for LayoutOptions {
    fn from(config: &crate::config::DocumentConfig) -> Self {
        Self {
            page_size: config.page_size_pt,
            title_caption: config.title_caption,
        }
    }
}

/// Greedy word wrap at `width` characters; words longer than a line are
/// split. Any whitespace, including newlines, separates words.
pub fn wrap(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        loop {
            let needed = if current_len == 0 { word.len() } else { current_len + 1 + word.len() };
            if needed <= width {
                if current_len > 0 {
                    current.push(' ');
                    current_len += 1;
                }
                current.extend(word.iter());
                current_len += word.len();
                break;
            }
            if current_len > 0 {
                lines.push(std::mem::take(&mut current));
                current_len = 0;
                continue;
            }
            // word alone is too long: hard split
            let rest = word.split_off(width);
            lines.push(word.into_iter().collect());
            word = rest;
        }
    }
    if current_len > 0 {
        lines.push(current);
    }
    lines
}

/// Helvetica advance widths (1/1000 em) for ASCII 32..=126.
const HELVETICA: [u16; 95] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278, // ' '..'/'
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, 278, 278, 584, 584, 584, 556, // '0'..'?'
    1015, 667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, 722, 778, // '@'..'O'
    667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, 278, 278, 278, 469, 556, // 'P'..'_'
    333, 556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, 556, 556, // '`'..'o'
    556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, 334, 260, 334, 584, // 'p'..'~'
];

const HELVETICA_BOLD: [u16; 95] = [
    278, 333, 474, 556, 556, 889, 722, 238, 333, 333, 389, 584, 278, 333, 278, 278, //
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, 333, 333, 584, 584, 584, 611, //
    975, 722, 722, 722, 722, 667, 611, 778, 722, 278, 556, 722, 611, 833, 722, 778, //
    667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, 333, 278, 333, 584, 556, //
    333, 556, 611, 556, 611, 556, 333, 611, 611, 278, 278, 556, 278, 889, 611, 611, //
    611, 611, 389, 556, 333, 611, 556, 778, 556, 556, 500, 389, 280, 389, 584, //
];

/// Width of `text` in points when set in `font` at `size`.
pub fn text_width(text: &str, font: &str, size: f32) -> f32 {
    let table = if font == FONT_BOLD { &HELVETICA_BOLD } else { &HELVETICA };
    let units: u32 = text
        .chars()
        .map(|c| {
            let base = match c {
                'ä' | 'à' | 'á' | 'â' => 'a',
                'ö' | 'ó' | 'ò' | 'ô' => 'o',
                'ü' | 'ú' | 'ù' | 'û' => 'u',
                'é' | 'è' | 'ê' => 'e',
                'Ä' => 'A',
                'Ö' => 'O',
                'Ü' => 'U',
                'ß' => 'B',
                '„' | '“' | '”' => '"',
                '‚' | '‘' | '’' => '\'',
                '–' => '-',
                c => c,
            };
            match base {
                ' '..='~' => u32::from(table[base as usize - 32]),
                '—' | '…' => 1000,
                _ => 556,
            }
        })
        .sum();
    units as f32 * size / 1000.0
}

/// Where an image of `w`x`h` pixels lands on a `size` page: fitted,
/// aspect preserved, centered. Returns `(x, y, width, height)`.
pub fn fit_image(w: u32, h: u32, size: f32) -> (f32, f32, f32, f32) {
    let scale = (size / w as f32).min(size / h as f32);
    let dw = w as f32 * scale;
    let dh = h as f32 * scale;
    ((size - dw) / 2.0, (size - dh) / 2.0, dw, dh)
}

/// Load and embed the image at `path`, if there is a usable one.
async fn embed_image(writer: &mut PdfWriter, path: Option<&str>) -> Option<(u32, u32, usize)> {
    let path = path?;
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(path, error = %e, "image not readable, leaving page blank");
            return None;
        }
    };
    match EmbeddedImage::decode(&bytes) {
        Ok(image) => {
            let id = writer.add_image(&image);
            Some((image.width, image.height, id))
        }
        Err(e) => {
            tracing::warn!(path, error = %e, "image cannot be decoded, leaving page blank");
            None
        }
    }
}

fn draw_page_caption(content: &mut ContentStream, text: &str, size: f32) {
    let lines = wrap(text, PAGE_WRAP);
    if lines.is_empty() {
        return;
    }
    let line_height = PAGE_FONT_SIZE + 4.0;
    let box_width = size - INCH;
    let box_height = lines.len() as f32 * line_height + 2.0 * PAGE_PADDING;
    let x_box = (size - box_width) / 2.0;
    let y_box = 0.6 * INCH;
    content.translucent_round_rect(x_box, y_box, box_width, box_height, 10.0);

    let mut y = y_box + box_height - PAGE_PADDING - PAGE_FONT_SIZE;
    for line in &lines {
        let x = size / 2.0 - text_width(line, FONT_REGULAR, PAGE_FONT_SIZE) / 2.0;
        content.text(FONT_REGULAR, PAGE_FONT_SIZE, (0.0, 0.0, 0.0), x, y, line);
        y -= line_height;
    }
}

fn draw_title_caption(content: &mut ContentStream, title: &str, size: f32) {
    let lines = wrap(title, TITLE_WRAP);
    if lines.is_empty() {
        return;
    }
    let line_height = TITLE_FONT_SIZE + 4.0;
    let total = lines.len() as f32 * line_height;
    let box_width = size - 2.0 * INCH;
    let box_height = total + 2.0 * PAGE_PADDING;
    let x_box = (size - box_width) / 2.0;
    let y_box = 0.75 * INCH;
    content.translucent_round_rect(x_box, y_box, box_width, box_height, 12.0);

    let mut y = y_box + PAGE_PADDING + total - line_height;
    for line in &lines {
        let x = size / 2.0 - text_width(line, FONT_BOLD, TITLE_FONT_SIZE) / 2.0;
        content.text(FONT_BOLD, TITLE_FONT_SIZE, TITLE_COLOR, x, y, line);
        y -= line_height;
    }
}

/// Lay out the book for `state` and write it to `output_path`.
///
/// Fails with `NoStoryline` when the state has no storyline. Returns the
/// path written.
pub async fn assemble(state: &State, output_path: &Path, options: &LayoutOptions) -> Result<PathBuf> {
    let storyline = state.storyline.as_ref().ok_or(PipelineError::NoStoryline)?;
    let size = options.page_size;
    let mut writer = PdfWriter::new(size);

    let mut cover = ContentStream::new();
    let mut cover_images = Vec::new();
    if let Some((w, h, id)) = embed_image(&mut writer, storyline.title_image_filepath.as_deref()).await {
        let (x, y, dw, dh) = fit_image(w, h, size);
        cover.image("Im0", x, y, dw, dh);
        cover_images.push(("Im0", id));
    }
    if options.title_caption {
        draw_title_caption(&mut cover, &storyline.title, size);
    }
    writer.add_page(&cover, &cover_images);

    for (index, page) in storyline.pages.iter().enumerate() {
        let mut content = ContentStream::new();
        let mut images = Vec::new();
        if let Some((w, h, id)) = embed_image(&mut writer, page.image_filepath.as_deref()).await {
            let (x, y, dw, dh) = fit_image(w, h, size);
            content.image("Im0", x, y, dw, dh);
            images.push(("Im0", id));
        } else {
            tracing::debug!(page = index + 1, "page has no image");
        }
        draw_page_caption(&mut content, &page.text, size);
        writer.add_page(&content, &images);
    }

    let pages = writer.page_count();
    let bytes = writer.finish();
    if let Some(parent) = output_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    write_atomic(output_path, &bytes).await?;
    tracing::info!(path = %output_path.display(), pages, bytes = bytes.len(), "document written");
    Ok(output_path.to_path_buf())
}
