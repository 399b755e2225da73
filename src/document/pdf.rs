//! A small PDF 1.4 writer: the standard Helvetica fonts, one transparency
//! state, raster images as deflated RGB with an optional soft mask, and
//! uncompressed content streams.

use std::fmt::Write as _;
use std::io::Write as _;

use flate2::write::ZlibEncoder;
use flate2::Compression;

/// Resource name of the regular font.
pub const FONT_REGULAR: &str = "F1";
/// Resource name of the bold font.
pub const FONT_BOLD: &str = "F2";
/// Resource name of the 60 % fill-opacity graphics state.
pub const GS_TRANSLUCENT: &str = "GS1";

/// Why an image cannot be embedded.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("cannot decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("cannot compress image samples: {0}")]
    Compress(#[from] std::io::Error),
    #[error("image has no pixels")]
    Empty,
}

/// A decoded raster, flattened to 8-bit RGB samples plus an optional 8-bit
/// alpha plane, both zlib-compressed for `/FlateDecode`.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedImage {
    pub width: u32,
    pub height: u32,
    rgb: Vec<u8>,
    alpha: Option<Vec<u8>>,
}

fn deflate(samples: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(samples)?;
    encoder.finish()
}

impl EmbeddedImage {
    /// Decode any format the `image` crate reads (PNG, JPEG, WebP), in any
    /// bit depth or color type.
    pub fn decode(bytes: &[u8]) -> Result<Self, EmbedError> {
        let decoded = image::load_from_memory(bytes)?;
        let (width, height) = (decoded.width(), decoded.height());
        if width == 0 || height == 0 {
            return Err(EmbedError::Empty);
        }
        let alpha = if decoded.color().has_alpha() {
            let plane: Vec<u8> = decoded.to_rgba8().pixels().map(|p| p.0[3]).collect();
            Some(deflate(&plane)?)
        } else {
            None
        };
        let rgb = deflate(decoded.to_rgb8().as_raw())?;
        Ok(Self {
            width,
            height,
            rgb,
            alpha,
        })
    }

    pub fn has_alpha(&self) -> bool {
        self.alpha.is_some()
    }
}

/// Format a coordinate with at most two decimals.
fn num(v: f32) -> String {
    let s = format!("{:.2}", v);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s.is_empty() || s == "-" || s == "-0" {
        "0".to_string()
    } else {
        s.to_string()
    }
}

/// Map a char to its WinAnsiEncoding byte. Unmappable chars become `?`.
pub fn win_ansi(c: char) -> u8 {
    match c {
        ' '..='~' => c as u8,
        '\u{a0}'..='\u{ff}' => c as u32 as u8,
        '€' => 0x80,
        '‚' => 0x82,
        '„' => 0x84,
        '…' => 0x85,
        '‘' => 0x91,
        '’' => 0x92,
        '“' => 0x93,
        '”' => 0x94,
        '•' => 0x95,
        '–' => 0x96,
        '—' => 0x97,
        _ => b'?',
    }
}

/// Encode `text` as a PDF literal string body.
fn literal(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 2);
    out.push(b'(');
    for c in text.chars() {
        let b = win_ansi(c);
        if matches!(b, b'(' | b')' | b'\\') {
            out.push(b'\\');
        }
        out.push(b);
    }
    out.push(b')');
    out
}

/// Operators for one page.
#[derive(Debug, Default)]
pub struct ContentStream {
    buf: Vec<u8>,
}

impl ContentStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn op(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(b'\n');
    }

    /// Paint image resource `name` into the given rectangle.
    pub fn image(&mut self, name: &str, x: f32, y: f32, w: f32, h: f32) {
        self.op(&format!(
            "q {} 0 0 {} {} {} cm /{} Do Q",
            num(w),
            num(h),
            num(x),
            num(y),
            name
        ));
    }

    /// Fill a rounded rectangle with white at 60 % opacity.
    pub fn translucent_round_rect(&mut self, x: f32, y: f32, w: f32, h: f32, r: f32) {
        let r = r.min(w / 2.0).min(h / 2.0);
        let k = 0.5523 * r;
        let mut path = String::new();
        let _ = write!(path, "q /{} gs 1 1 1 rg ", GS_TRANSLUCENT);
        let _ = write!(path, "{} {} m ", num(x + r), num(y));
        let _ = write!(path, "{} {} l ", num(x + w - r), num(y));
        let _ = write!(
            path,
            "{} {} {} {} {} {} c ",
            num(x + w - r + k),
            num(y),
            num(x + w),
            num(y + r - k),
            num(x + w),
            num(y + r)
        );
        let _ = write!(path, "{} {} l ", num(x + w), num(y + h - r));
        let _ = write!(
            path,
            "{} {} {} {} {} {} c ",
            num(x + w),
            num(y + h - r + k),
            num(x + w - r + k),
            num(y + h),
            num(x + w - r),
            num(y + h)
        );
        let _ = write!(path, "{} {} l ", num(x + r), num(y + h));
        let _ = write!(
            path,
            "{} {} {} {} {} {} c ",
            num(x + r - k),
            num(y + h),
            num(x),
            num(y + h - r + k),
            num(x),
            num(y + h - r)
        );
        let _ = write!(path, "{} {} l ", num(x), num(y + r));
        let _ = write!(
            path,
            "{} {} {} {} {} {} c ",
            num(x),
            num(y + r - k),
            num(x + r - k),
            num(y),
            num(x + r),
            num(y)
        );
        path.push_str("h f Q");
        self.op(&path);
    }

    /// Show one line of text with its baseline starting at (`x`, `y`).
    pub fn text(&mut self, font: &str, size: f32, rgb: (f32, f32, f32), x: f32, y: f32, text: &str) {
        self.op(&format!(
            "BT /{} {} Tf {} {} {} rg {} {} Td",
            font,
            num(size),
            num(rgb.0),
            num(rgb.1),
            num(rgb.2),
            num(x),
            num(y)
        ));
        self.buf.extend_from_slice(&literal(text));
        self.op(" Tj ET");
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Accumulates objects and serializes them with a cross-reference table.
#[derive(Debug)]
pub struct PdfWriter {
    objects: Vec<Option<Vec<u8>>>,
    page_ids: Vec<usize>,
    page_size: f32,
    catalog_id: usize,
    pages_id: usize,
    font_regular_id: usize,
    font_bold_id: usize,
    gs_id: usize,
}

impl PdfWriter {
    /// Start a document whose pages are `page_size` points square.
    pub fn new(page_size: f32) -> Self {
        let mut writer = Self {
            objects: Vec::new(),
            page_ids: Vec::new(),
            page_size,
            catalog_id: 0,
            pages_id: 0,
            font_regular_id: 0,
            font_bold_id: 0,
            gs_id: 0,
        };
        writer.catalog_id = writer.alloc();
        writer.pages_id = writer.alloc();
        writer.font_regular_id = writer.push(
            b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>"
                .to_vec(),
        );
        writer.font_bold_id = writer.push(
            b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica-Bold /Encoding /WinAnsiEncoding >>"
                .to_vec(),
        );
        writer.gs_id = writer.push(b"<< /Type /ExtGState /ca 0.6 /CA 0.6 >>".to_vec());
        writer
    }

    fn alloc(&mut self) -> usize {
        self.objects.push(None);
        self.objects.len()
    }

    fn set(&mut self, id: usize, body: Vec<u8>) {
        self.objects[id - 1] = Some(body);
    }

    fn push(&mut self, body: Vec<u8>) -> usize {
        let id = self.alloc();
        self.set(id, body);
        id
    }

    fn stream(dict: &str, data: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(data.len() + dict.len() + 64);
        body.extend_from_slice(format!("<< {} /Length {} >>\nstream\n", dict, data.len()).as_bytes());
        body.extend_from_slice(data);
        body.extend_from_slice(b"\nendstream");
        body
    }

    /// Embed an image; returns its object id. An alpha plane becomes a
    /// soft mask.
    pub fn add_image(&mut self, image: &EmbeddedImage) -> usize {
        let smask = image.alpha.as_ref().map(|alpha| {
            let dict = format!(
                "/Type /XObject /Subtype /Image /Width {} /Height {} /ColorSpace /DeviceGray /BitsPerComponent 8 /Filter /FlateDecode",
                image.width, image.height
            );
            self.push(Self::stream(&dict, alpha))
        });
        let mut dict = format!(
            "/Type /XObject /Subtype /Image /Width {} /Height {} /ColorSpace /DeviceRGB /BitsPerComponent 8 /Filter /FlateDecode",
            image.width, image.height
        );
        if let Some(id) = smask {
            let _ = write!(dict, " /SMask {} 0 R", id);
        }
        self.push(Self::stream(&dict, &image.rgb))
    }

    /// Append a page drawing `content`. `images` maps resource names to
    /// object ids returned by [`add_image`](Self::add_image).
    pub fn add_page(&mut self, content: &ContentStream, images: &[(&str, usize)]) {
        let content_id = self.push(Self::stream("", content.as_bytes()));
        let xobjects: String = images
            .iter()
            .map(|(name, id)| format!("/{} {} 0 R ", name, id))
            .collect();
        let page = format!(
            "<< /Type /Page /Parent {} 0 R /MediaBox [0 0 {} {}] /Resources << /Font << /{} {} 0 R /{} {} 0 R >> /ExtGState << /{} {} 0 R >> /XObject << {}>> >> /Contents {} 0 R >>",
            self.pages_id,
            num(self.page_size),
            num(self.page_size),
            FONT_REGULAR,
            self.font_regular_id,
            FONT_BOLD,
            self.font_bold_id,
            GS_TRANSLUCENT,
            self.gs_id,
            xobjects,
            content_id
        );
        let page_id = self.push(page.into_bytes());
        self.page_ids.push(page_id);
    }

    pub fn page_count(&self) -> usize {
        self.page_ids.len()
    }

    /// Serialize the document.
    pub fn finish(mut self) -> Vec<u8> {
        let kids: String = self
            .page_ids
            .iter()
            .map(|id| format!("{} 0 R", id))
            .collect::<Vec<_>>()
            .join(" ");
        let pages = format!(
            "<< /Type /Pages /Kids [{}] /Count {} >>",
            kids,
            self.page_ids.len()
        );
        self.set(self.pages_id, pages.into_bytes());
        let catalog = format!("<< /Type /Catalog /Pages {} 0 R >>", self.pages_id);
        self.set(self.catalog_id, catalog.into_bytes());

        let mut out: Vec<u8> = b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n".to_vec();
        let mut offsets = Vec::with_capacity(self.objects.len());
        for (i, body) in self.objects.iter().enumerate() {
            offsets.push(out.len());
            out.extend_from_slice(format!("{} 0 obj\n", i + 1).as_bytes());
            out.extend_from_slice(body.as_deref().unwrap_or(b"null"));
            out.extend_from_slice(b"\nendobj\n");
        }

        let xref_at = out.len();
        out.extend_from_slice(format!("xref\n0 {}\n", self.objects.len() + 1).as_bytes());
        out.extend_from_slice(b"0000000000 65535 f \n");
        for offset in offsets {
            out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
        }
        out.extend_from_slice(
            format!(
                "trailer\n<< /Size {} /Root {} 0 R >>\nstartxref\n{}\n%%EOF\n",
                self.objects.len() + 1,
                self.catalog_id,
                xref_at
            )
            .as_bytes(),
        );
        out
    }
}
