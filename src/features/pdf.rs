//! Screen-to-PDF coordinate transform and annotation embedding.
//!
//! Everything here is stateless: an artifact goes in as bytes and a new
//! buffer comes out. Screen space has its origin at the top-left of the
//! rendered page; PDF user space has its origin at the bottom-left, in points.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{DateTime, TimeZone};
use image::ImageFormat;
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_FONT_SIZE: f64 = 12.0;
pub const DEFAULT_PADDING_PT: f64 = 50.0;
pub const SERVER_SIGNATURE_WIDTH_PT: f64 = 200.0;
/// Used when a page carries no usable MediaBox anywhere in its ancestry.
pub const FALLBACK_PAGE_SIZE: PageSize = PageSize {
    width: 595.0,
    height: 842.0,
};

const IMAGE_RESOURCE_PREFIX: &str = "ImSig";
const FONT_RESOURCE_PREFIX: &str = "FSig";
const SAVE_STATE: &[u8] = b"q\n";
const RESTORE_STATE: &[u8] = b"Q\n";

#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("corrupt pdf: {0}")]
    CorruptPdf(String),
    #[error("pdf has no pages")]
    NoPages,
    #[error("page {index} out of range (document has {count} pages)")]
    PageOutOfRange { index: usize, count: usize },
    #[error("unsupported image format")]
    UnsupportedImage,
    #[error("invalid signature encoding: {0}")]
    InvalidEncoding(String),
    #[error("invalid viewport: {0}")]
    InvalidViewport(String),
    #[error("invalid placement: {0}")]
    InvalidPlacement(String),
    #[error("text annotation is empty")]
    EmptyText,
    #[error("pdf write failed: {0}")]
    Write(String),
}

impl EmbedError {
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenPoint {
    pub x: f64,
    pub y: f64,
}

impl ScreenPoint {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PdfPoint {
    pub x: f64,
    pub y: f64,
}

/// Size of the page as the viewer rendered it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width_px: f64,
    pub rendered_height_px: f64,
}

impl Viewport {
    pub const fn new(width_px: f64, rendered_height_px: f64) -> Self {
        Self {
            width_px,
            rendered_height_px,
        }
    }

    fn validate(&self) -> Result<(), EmbedError> {
        if !(self.width_px.is_finite() && self.width_px > 0.0) {
            return Err(EmbedError::InvalidViewport(format!(
                "width must be positive, got {}",
                self.width_px
            )));
        }
        if !(self.rendered_height_px.is_finite() && self.rendered_height_px > 0.0) {
            return Err(EmbedError::InvalidViewport(format!(
                "rendered height must be positive, got {}",
                self.rendered_height_px
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSize {
    pub width: f64,
    pub height: f64,
}

impl PageSize {
    fn validate(&self) -> Result<(), EmbedError> {
        if !(self.width.is_finite() && self.width > 0.0 && self.height.is_finite() && self.height > 0.0) {
            return Err(EmbedError::InvalidPlacement(format!(
                "page size must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

fn ensure_finite(what: &str, value: f64) -> Result<(), EmbedError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(EmbedError::InvalidPlacement(format!("{what} must be finite, got {value}")))
    }
}

fn ensure_color(color: Rgb) -> Result<(), EmbedError> {
    ensure_finite("color", color.0)?;
    ensure_finite("color", color.1)?;
    ensure_finite("color", color.2)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageTarget {
    /// Zero-based page index.
    Index(usize),
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rgb(pub f64, pub f64, pub f64);

impl Rgb {
    pub const BLACK: Rgb = Rgb(0.0, 0.0, 0.0);
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ImageSize {
    /// Fixed width in points; height follows the source aspect ratio.
    Width(f64),
    Exact { width: f64, height: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationContent {
    Image { bytes: Vec<u8>, size: ImageSize },
    Text { text: String, font_size: f64, color: Rgb },
}

impl AnnotationContent {
    pub fn text(text: impl Into<String>) -> Self {
        AnnotationContent::Text {
            text: text.into(),
            font_size: DEFAULT_FONT_SIZE,
            color: Rgb::BLACK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CaptionPosition {
    /// Baseline this many points under the bottom edge of the content.
    Below(f64),
    /// Baseline this many points over the top edge of the content.
    Above(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Caption {
    pub text: String,
    pub font_size: f64,
    pub color: Rgb,
    pub position: CaptionPosition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub page: PageTarget,
    /// Top-left corner of the content in screen space. `None` falls back to
    /// a fixed padding from the bottom-right corner of the page.
    pub anchor: Option<ScreenPoint>,
    pub viewport: Viewport,
    /// Page size in points; read from the page MediaBox when absent.
    pub page_size: Option<PageSize>,
    pub content_height_px: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbedRequest {
    pub placement: Placement,
    pub content: AnnotationContent,
    pub captions: Vec<Caption>,
}

/// Where the content landed, in PDF user space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrawRect {
    pub page_index: usize,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone)]
pub struct Embedded {
    pub bytes: Vec<u8>,
    pub rect: DrawRect,
}

/// Map a screen anchor onto PDF user space.
///
/// The returned point is the bottom-left corner of content whose visual
/// top-left corner sits at `anchor`.
pub fn screen_to_pdf(
    page: PageSize,
    viewport: Viewport,
    anchor: ScreenPoint,
    content_height_px: f64,
) -> Result<PdfPoint, EmbedError> {
    viewport.validate()?;
    page.validate()?;
    ensure_finite("anchor x", anchor.x)?;
    ensure_finite("anchor y", anchor.y)?;
    ensure_finite("content height", content_height_px)?;
    let scale_x = page.width / viewport.width_px;
    let scale_y = page.height / viewport.rendered_height_px;
    Ok(PdfPoint {
        x: anchor.x * scale_x,
        y: page.height - (anchor.y * scale_y) - (content_height_px * scale_y),
    })
}

/// Resolve the rectangle a piece of content occupies on a page of known size.
pub fn resolve_rect(
    page_index: usize,
    page: PageSize,
    placement: &Placement,
    content_size: (f64, f64),
) -> Result<DrawRect, EmbedError> {
    let (width, height) = content_size;
    page.validate()?;
    ensure_finite("content width", width)?;
    ensure_finite("content height", height)?;
    let origin = match placement.anchor {
        Some(anchor) => screen_to_pdf(page, placement.viewport, anchor, placement.content_height_px)?,
        None => PdfPoint {
            x: (page.width - width - DEFAULT_PADDING_PT).max(0.0),
            y: DEFAULT_PADDING_PT,
        },
    };
    Ok(DrawRect {
        page_index,
        x: origin.x,
        y: origin.y,
        width,
        height,
    })
}

/// Draw `request.content` into the artifact and return the new bytes.
pub fn embed_annotation(artifact: &[u8], request: &EmbedRequest) -> Result<Embedded, EmbedError> {
    let mut doc = Document::load_mem(artifact).map_err(|e| EmbedError::CorruptPdf(e.to_string()))?;
    let (page_index, page_id) = resolve_page(&doc, request.placement.page)?;
    let media = page_box(&doc, page_id);
    let page = request.placement.page_size.unwrap_or(PageSize {
        width: media.width,
        height: media.height,
    });

    for caption in &request.captions {
        let offset = match caption.position {
            CaptionPosition::Below(offset) | CaptionPosition::Above(offset) => offset,
        };
        ensure_finite("caption offset", offset)?;
        ensure_finite("caption font size", caption.font_size)?;
        ensure_color(caption.color)?;
    }

    let mut resources = page_resources(&doc, page_id)?;
    let mut ops: Vec<u8> = SAVE_STATE.to_vec();

    let rect = match &request.content {
        AnnotationContent::Image { bytes, size } => {
            let decoded = decode_image(bytes)?;
            let (w, h) = target_image_size(*size, decoded.width, decoded.height);
            let rect = resolve_rect(page_index, page, &request.placement, (w, h))?;
            let image_id = add_image_objects(&mut doc, decoded);
            let name = register_resource(&doc, &mut resources, b"XObject", IMAGE_RESOURCE_PREFIX, image_id.into());
            ops.extend_from_slice(
                format!(
                    "q {} 0 0 {} {} {} cm /{} Do Q\n",
                    fmt_num(rect.width),
                    fmt_num(rect.height),
                    fmt_num(media.llx + rect.x),
                    fmt_num(media.lly + rect.y),
                    name
                )
                .as_bytes(),
            );
            rect
        }
        AnnotationContent::Text {
            text,
            font_size,
            color,
        } => {
            if text.trim().is_empty() {
                return Err(EmbedError::EmptyText);
            }
            ensure_color(*color)?;
            let size = if *font_size > 0.0 { *font_size } else { DEFAULT_FONT_SIZE };
            let rect = resolve_rect(page_index, page, &request.placement, (estimate_text_width(text, size), size))?;
            let font = ensure_font(&mut doc, &mut resources);
            push_text(&mut ops, &font, size, *color, media.llx + rect.x, media.lly + rect.y, text);
            rect
        }
    };

    if !request.captions.is_empty() {
        let font = ensure_font(&mut doc, &mut resources);
        for caption in &request.captions {
            let y = match caption.position {
                CaptionPosition::Below(offset) => rect.y - offset,
                CaptionPosition::Above(offset) => rect.y + rect.height + offset,
            };
            push_text(&mut ops, &font, caption.font_size, caption.color, media.llx + rect.x, media.lly + y, &caption.text);
        }
    }

    ops.extend_from_slice(RESTORE_STATE);

    isolate_existing_content(&mut doc, page_id)?;
    {
        let page_dict = doc
            .get_object_mut(page_id)
            .and_then(|o| o.as_dict_mut())
            .map_err(|_| EmbedError::CorruptPdf("page is not a dictionary".into()))?;
        page_dict.set("Resources", Object::Dictionary(resources));
    }
    doc.add_page_contents(page_id, ops)
        .map_err(|e| EmbedError::CorruptPdf(format!("add content failed: {e}")))?;

    let mut bytes = Vec::with_capacity(artifact.len() + 1024);
    doc.save_to(&mut bytes)
        .map_err(|e| EmbedError::Write(e.to_string()))?;
    debug!(
        page = rect.page_index,
        x = rect.x,
        y = rect.y,
        width = rect.width,
        height = rect.height,
        "annotation embedded"
    );
    Ok(Embedded { bytes, rect })
}

/// Request used by the single-shot server signing path: last page, bottom
/// right corner, a label above and a timestamp below.
pub fn server_signature_request(image: Vec<u8>, signed_label: String) -> EmbedRequest {
    let grey = Rgb(0.5, 0.5, 0.5);
    EmbedRequest {
        placement: Placement {
            page: PageTarget::Last,
            anchor: None,
            viewport: Viewport::new(1.0, 1.0),
            page_size: None,
            content_height_px: 0.0,
        },
        content: AnnotationContent::Image {
            bytes: image,
            size: ImageSize::Width(SERVER_SIGNATURE_WIDTH_PT),
        },
        captions: vec![
            Caption {
                text: "Digitally Signed".to_string(),
                font_size: 10.0,
                color: grey,
                position: CaptionPosition::Above(10.0),
            },
            Caption {
                text: signed_label,
                font_size: 8.0,
                color: grey,
                position: CaptionPosition::Below(15.0),
            },
        ],
    }
}

/// "Signed: MM/DD/YYYY HH:MM" for the given instant.
pub fn signed_caption<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("Signed: {}", at.format("%m/%d/%Y %H:%M"))
}

/// Strip an optional `data:image/...;base64,` prefix and decode.
pub fn decode_signature_data(data: &str) -> Result<Vec<u8>, EmbedError> {
    static DATA_URL: OnceLock<Option<Regex>> = OnceLock::new();
    let trimmed = data.trim();
    let payload = match DATA_URL.get_or_init(|| Regex::new(r"^data:image/(png|jpeg|jpg);base64,").ok()) {
        Some(re) => match re.find(trimmed) {
            Some(m) => &trimmed[m.end()..],
            None => trimmed,
        },
        None => trimmed,
    };
    if payload.is_empty() {
        return Err(EmbedError::InvalidEncoding("empty payload".into()));
    }
    B64.decode(payload.as_bytes())
        .map_err(|e| EmbedError::InvalidEncoding(e.to_string()))
}

pub fn page_count(artifact: &[u8]) -> Result<usize, EmbedError> {
    let doc = Document::load_mem(artifact).map_err(|e| EmbedError::CorruptPdf(e.to_string()))?;
    Ok(doc.get_pages().len())
}

/// Sizes of every page in order, in points.
pub fn page_sizes(artifact: &[u8]) -> Result<Vec<PageSize>, EmbedError> {
    let doc = Document::load_mem(artifact).map_err(|e| EmbedError::CorruptPdf(e.to_string()))?;
    Ok(doc
        .get_pages()
        .values()
        .map(|id| {
            let b = page_box(&doc, *id);
            PageSize {
                width: b.width,
                height: b.height,
            }
        })
        .collect())
}

#[derive(Debug)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    rgb: Vec<u8>,
    alpha: Option<Vec<u8>>,
}

/// PNG first, then JPEG; anything else is rejected.
pub fn decode_image(bytes: &[u8]) -> Result<DecodedImage, EmbedError> {
    let img = image::load_from_memory_with_format(bytes, ImageFormat::Png)
        .or_else(|png_err| {
            debug!(error = %png_err, "png decode failed, trying jpeg");
            image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)
        })
        .map_err(|_| EmbedError::UnsupportedImage)?
        .to_rgba8();
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(EmbedError::UnsupportedImage);
    }
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    let mut alpha = Vec::with_capacity((width * height) as usize);
    for pixel in img.pixels() {
        rgb.push(pixel[0]);
        rgb.push(pixel[1]);
        rgb.push(pixel[2]);
        alpha.push(pixel[3]);
    }
    let alpha = if alpha.iter().all(|a| *a == u8::MAX) {
        None
    } else {
        Some(alpha)
    };
    Ok(DecodedImage {
        width,
        height,
        rgb,
        alpha,
    })
}

fn target_image_size(size: ImageSize, img_w: u32, img_h: u32) -> (f64, f64) {
    match size {
        ImageSize::Exact { width, height } => (width.max(1.0), height.max(1.0)),
        ImageSize::Width(width) => {
            let width = width.max(1.0);
            let ratio = img_h as f64 / img_w as f64;
            (width, (width * ratio).max(1.0))
        }
    }
}

fn add_image_objects(doc: &mut Document, img: DecodedImage) -> ObjectId {
    let mut image_dict = dictionary! {
        "Type" => "XObject",
        "Subtype" => "Image",
        "Width" => img.width as i64,
        "Height" => img.height as i64,
        "ColorSpace" => "DeviceRGB",
        "BitsPerComponent" => 8,
    };
    if let Some(alpha) = img.alpha {
        let smask_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => img.width as i64,
                "Height" => img.height as i64,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
            },
            alpha,
        ));
        image_dict.set("SMask", smask_id);
    }
    doc.add_object(Stream::new(image_dict, img.rgb))
}

/// Bracket the page's current content streams with `q`/`Q` so a transform
/// or colour it leaves behind cannot leak into appended operators. Pages
/// already bracketed by an earlier embed are left alone; everything this
/// module appends is balanced.
fn isolate_existing_content(doc: &mut Document, page_id: ObjectId) -> Result<(), EmbedError> {
    let streams = doc.get_page_contents(page_id);
    let Some(first) = streams.first() else {
        return Ok(());
    };
    if let Ok(Object::Stream(stream)) = doc.get_object(*first) {
        if stream.content == SAVE_STATE {
            return Ok(());
        }
    }
    let open = doc.add_object(Stream::new(dictionary! {}, SAVE_STATE.to_vec()));
    let close = doc.add_object(Stream::new(dictionary! {}, RESTORE_STATE.to_vec()));
    let mut refs: Vec<Object> = Vec::with_capacity(streams.len() + 2);
    refs.push(open.into());
    refs.extend(streams.into_iter().map(Object::from));
    refs.push(close.into());
    let page_dict = doc
        .get_object_mut(page_id)
        .and_then(|o| o.as_dict_mut())
        .map_err(|_| EmbedError::CorruptPdf("page is not a dictionary".into()))?;
    page_dict.set("Contents", refs);
    Ok(())
}

fn resolve_page(doc: &Document, target: PageTarget) -> Result<(usize, ObjectId), EmbedError> {
    let pages: BTreeMap<u32, ObjectId> = doc.get_pages();
    let count = pages.len();
    if count == 0 {
        return Err(EmbedError::NoPages);
    }
    let index = match target {
        PageTarget::Index(i) => i,
        PageTarget::Last => count - 1,
    };
    let page_number = u32::try_from(index + 1).map_err(|_| EmbedError::PageOutOfRange { index, count })?;
    pages
        .get(&page_number)
        .map(|id| (index, *id))
        .ok_or(EmbedError::PageOutOfRange { index, count })
}

#[derive(Debug, Clone, Copy)]
struct PageBox {
    llx: f64,
    lly: f64,
    width: f64,
    height: f64,
}

fn page_box(doc: &Document, page_id: ObjectId) -> PageBox {
    let mut current = Some(page_id);
    while let Some(id) = current {
        let Ok(dict) = doc.get_object(id).and_then(|o| o.as_dict()) else {
            break;
        };
        if let Some(found) = extract_media_box(doc, dict) {
            return found;
        }
        current = dict.get(b"Parent").and_then(|p| p.as_reference()).ok();
    }
    PageBox {
        llx: 0.0,
        lly: 0.0,
        width: FALLBACK_PAGE_SIZE.width,
        height: FALLBACK_PAGE_SIZE.height,
    }
}

fn extract_media_box(doc: &Document, dict: &Dictionary) -> Option<PageBox> {
    let raw = dict.get(b"MediaBox").ok()?;
    let resolved = match raw {
        Object::Reference(id) => doc.get_object(*id).ok()?,
        other => other,
    };
    let arr = resolved.as_array().ok()?;
    if arr.len() != 4 {
        return None;
    }
    let llx = obj_to_f64(&arr[0])?;
    let lly = obj_to_f64(&arr[1])?;
    let urx = obj_to_f64(&arr[2])?;
    let ury = obj_to_f64(&arr[3])?;
    Some(PageBox {
        llx,
        lly,
        width: urx - llx,
        height: ury - lly,
    })
}

fn obj_to_f64(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(f) => Some((*f).into()),
        _ => None,
    }
}

fn resolve_dict(doc: &Document, obj: &Object) -> Option<Dictionary> {
    match obj {
        Object::Dictionary(dict) => Some(dict.clone()),
        Object::Reference(id) => doc.get_object(*id).and_then(|o| o.as_dict()).ok().cloned(),
        _ => None,
    }
}

/// Owned copy of the resources the page effectively uses, including
/// resources inherited from the page tree. Written back as a direct
/// dictionary so pages sharing a resources object stay untouched.
fn page_resources(doc: &Document, page_id: ObjectId) -> Result<Dictionary, EmbedError> {
    let mut current = Some(page_id);
    while let Some(id) = current {
        let dict = doc
            .get_object(id)
            .and_then(|o| o.as_dict())
            .map_err(|_| EmbedError::CorruptPdf("page is not a dictionary".into()))?;
        if let Ok(res) = dict.get(b"Resources") {
            return resolve_dict(doc, res)
                .ok_or_else(|| EmbedError::CorruptPdf("page resources are not a dictionary".into()));
        }
        current = dict.get(b"Parent").and_then(|p| p.as_reference()).ok();
    }
    Ok(dictionary! {})
}

/// Add `value` under a fresh `<prefix><n>` name in `resources[category]`.
fn register_resource(
    doc: &Document,
    resources: &mut Dictionary,
    category: &[u8],
    prefix: &str,
    value: Object,
) -> String {
    let mut entries = resources
        .get(category)
        .ok()
        .and_then(|o| resolve_dict(doc, o))
        .unwrap_or_else(Dictionary::new);
    let name = (1..)
        .map(|n| format!("{prefix}{n}"))
        .find(|candidate| !entries.has(candidate.as_bytes()))
        .unwrap_or_else(|| prefix.to_string());
    entries.set(name.clone(), value);
    resources.set(category.to_vec(), Object::Dictionary(entries));
    name
}

/// Reuse a Helvetica resource added by an earlier embed, or add one.
fn ensure_font(doc: &mut Document, resources: &mut Dictionary) -> String {
    let existing = resources
        .get(b"Font")
        .ok()
        .and_then(|o| resolve_dict(doc, o))
        .and_then(|fonts| {
            fonts.iter().find_map(|(name, obj)| {
                let name = String::from_utf8_lossy(name).into_owned();
                if !name.starts_with(FONT_RESOURCE_PREFIX) {
                    return None;
                }
                let font = resolve_dict(doc, obj)?;
                let base = font.get(b"BaseFont").and_then(|b| b.as_name()).ok()?;
                (base == b"Helvetica").then_some(name)
            })
        });
    if let Some(name) = existing {
        return name;
    }
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    register_resource(doc, resources, b"Font", FONT_RESOURCE_PREFIX, font_id.into())
}

fn push_text(out: &mut Vec<u8>, font: &str, size: f64, color: Rgb, x: f64, y: f64, text: &str) {
    out.extend_from_slice(
        format!(
            "BT /{} {} Tf {} {} {} rg {} {} Td (",
            font,
            fmt_num(size),
            fmt_num(color.0),
            fmt_num(color.1),
            fmt_num(color.2),
            fmt_num(x),
            fmt_num(y)
        )
        .as_bytes(),
    );
    out.extend_from_slice(&escape_pdf_text(text));
    out.extend_from_slice(b") Tj ET\n");
}

/// Literal-string bytes for a single-byte font.
fn escape_pdf_text(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '(' | ')' | '\\' => {
                out.push(b'\\');
                out.push(ch as u8);
            }
            '\n' | '\r' | '\t' => out.push(b' '),
            c if (c as u32) < 0x20 => {}
            c if (c as u32) <= 0xFF => out.push(c as u32 as u8),
            _ => out.push(b'?'),
        }
    }
    out
}

// Helvetica averages a little over half an em per glyph.
fn estimate_text_width(text: &str, size: f64) -> f64 {
    text.chars().count() as f64 * size * 0.55
}

fn fmt_num(v: f64) -> String {
    let rounded = (v * 10_000.0).round() / 10_000.0;
    let s = format!("{rounded:.4}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" || s.is_empty() {
        "0".to_string()
    } else {
        s.to_string()
    }
}
