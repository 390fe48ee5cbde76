//! Client-side annotation session: sequential embeds with linear undo.

use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::features::pdf::{
    embed_annotation, page_count, signed_caption, AnnotationContent, Caption, CaptionPosition,
    DrawRect, EmbedError, EmbedRequest, ImageSize, PageTarget, Placement, Rgb, ScreenPoint,
    Viewport, DEFAULT_FONT_SIZE,
};
use crate::ui::{to_value_or_text, Button as UiButton, Column as UiColumn, FieldOverlay, Text as UiText};

pub const SIGNATURE_WIDTH_PT: f64 = 120.0;
pub const SIGNATURE_HEIGHT_PT: f64 = 60.0;
const SIGNATURE_CAPTION_GREY: Rgb = Rgb(0.3, 0.3, 0.3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Signature,
    Name,
    Email,
    Date,
    CustomText,
}

impl FieldKind {
    pub const ALL: [FieldKind; 5] = [
        FieldKind::Signature,
        FieldKind::Name,
        FieldKind::Email,
        FieldKind::Date,
        FieldKind::CustomText,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FieldKind::Signature => "signature",
            FieldKind::Name => "name",
            FieldKind::Email => "email",
            FieldKind::Date => "date",
            FieldKind::CustomText => "custom_text",
        }
    }

    /// Where the overlay starts when the user never drags it.
    pub fn default_anchor(self) -> ScreenPoint {
        match self {
            FieldKind::Signature => ScreenPoint::new(300.0, 200.0),
            FieldKind::Name => ScreenPoint::new(100.0, 300.0),
            FieldKind::Email => ScreenPoint::new(100.0, 350.0),
            FieldKind::Date => ScreenPoint::new(100.0, 400.0),
            FieldKind::CustomText => ScreenPoint::new(100.0, 450.0),
        }
    }

    pub fn content_height_px(self) -> f64 {
        match self {
            FieldKind::Signature => 60.0,
            _ => 20.0,
        }
    }

    fn takes_image(self) -> bool {
        matches!(self, FieldKind::Signature)
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldPayload {
    Image(Vec<u8>),
    Text(String),
}

impl FieldPayload {
    /// Signing date as shown in the date field.
    pub fn date(at: &DateTime<Local>) -> Self {
        FieldPayload::Text(at.format("%m/%d/%Y").to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("finish placing the {0} field first")]
    AnotherFieldActive(FieldKind),
    #[error("no field is being placed")]
    NothingPlacing,
    #[error("the {kind} field needs {expected} content")]
    PayloadMismatch { kind: FieldKind, expected: &'static str },
    #[error("place a signature first")]
    NothingToSubmit,
    #[error("no annotation session is open for this document")]
    NotOpen,
    #[error(transparent)]
    Embed(#[from] EmbedError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPhase {
    Idle,
    Placing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveField {
    pub kind: FieldKind,
    pub page_index: usize,
    pub position: ScreenPoint,
    pub payload: FieldPayload,
}

/// Working copy as it was before a confirmed embed.
#[derive(Debug, Clone)]
pub struct PdfSnapshot {
    pub bytes: Vec<u8>,
    pub replaced_by: FieldKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoOutcome {
    Restored(FieldKind),
    NothingToUndo,
}

#[derive(Debug)]
pub struct AnnotationSession {
    original: Vec<u8>,
    working: Vec<u8>,
    history: Vec<PdfSnapshot>,
    active: Option<ActiveField>,
    viewport: Viewport,
    page_count: usize,
    history_limit: Option<usize>,
    notice: Option<String>,
}

impl AnnotationSession {
    pub fn new(original: Vec<u8>, viewport: Viewport) -> Result<Self, SessionError> {
        let page_count = page_count(&original)?;
        if page_count == 0 {
            return Err(EmbedError::NoPages.into());
        }
        Ok(Self {
            working: original.clone(),
            original,
            history: Vec::new(),
            active: None,
            viewport,
            page_count,
            history_limit: None,
            notice: None,
        })
    }

    /// Cap the undo stack; the oldest snapshot is dropped past the cap.
    pub fn with_history_limit(mut self, limit: Option<usize>) -> Self {
        self.history_limit = limit.filter(|l| *l > 0);
        self
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn original(&self) -> &[u8] {
        &self.original
    }

    pub fn working_copy(&self) -> &[u8] {
        &self.working
    }

    pub fn history_depth(&self) -> usize {
        self.history.len()
    }

    pub fn active(&self) -> Option<&ActiveField> {
        self.active.as_ref()
    }

    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    pub fn phase(&self, kind: FieldKind) -> FieldPhase {
        match &self.active {
            Some(active) if active.kind == kind => FieldPhase::Placing,
            _ => FieldPhase::Idle,
        }
    }

    pub fn has_edits(&self) -> bool {
        self.working != self.original
    }

    /// Idle → Placing. Only one field may be placed at a time.
    pub fn begin(&mut self, kind: FieldKind, page_index: usize, payload: FieldPayload) -> Result<(), SessionError> {
        if let Some(active) = &self.active {
            return Err(SessionError::AnotherFieldActive(active.kind));
        }
        match (&payload, kind.takes_image()) {
            (FieldPayload::Image(_), false) => {
                return Err(SessionError::PayloadMismatch { kind, expected: "text" })
            }
            (FieldPayload::Text(_), true) => {
                return Err(SessionError::PayloadMismatch { kind, expected: "image" })
            }
            (FieldPayload::Text(text), false) if text.trim().is_empty() => {
                return Err(EmbedError::EmptyText.into())
            }
            _ => {}
        }
        if page_index >= self.page_count {
            return Err(EmbedError::PageOutOfRange {
                index: page_index,
                count: self.page_count,
            }
            .into());
        }
        self.active = Some(ActiveField {
            kind,
            page_index,
            position: kind.default_anchor(),
            payload,
        });
        self.notice = None;
        Ok(())
    }

    /// Drag update for the field being placed.
    pub fn move_to(&mut self, position: ScreenPoint) -> Result<(), SessionError> {
        let active = self.active.as_mut().ok_or(SessionError::NothingPlacing)?;
        active.position = position;
        Ok(())
    }

    /// Placing → Cancelled. A no-op when nothing is being placed.
    pub fn cancel(&mut self) -> Option<FieldKind> {
        let cancelled = self.active.take().map(|a| a.kind);
        if let Some(kind) = cancelled {
            debug!(field = %kind, "annotation cancelled");
        }
        cancelled
    }

    pub fn confirm(&mut self) -> Result<DrawRect, SessionError> {
        self.confirm_at(Local::now())
    }

    /// Placing → Confirmed. On failure the working copy, the history and
    /// the placing field are left exactly as they were.
    pub fn confirm_at(&mut self, now: DateTime<Local>) -> Result<DrawRect, SessionError> {
        let active = self.active.as_ref().ok_or(SessionError::NothingPlacing)?;
        let request = build_request(active, self.viewport, &now);
        let embedded = embed_annotation(&self.working, &request)?;

        let kind = active.kind;
        let previous = std::mem::replace(&mut self.working, embedded.bytes);
        self.history.push(PdfSnapshot {
            bytes: previous,
            replaced_by: kind,
        });
        if let Some(limit) = self.history_limit {
            while self.history.len() > limit {
                self.history.remove(0);
            }
        }
        self.active = None;
        self.notice = Some(format!("{} embedded", capitalize(kind.as_str())));
        debug!(field = %kind, page = embedded.rect.page_index, depth = self.history.len(), "annotation confirmed");
        Ok(embedded.rect)
    }

    pub fn undo(&mut self) -> UndoOutcome {
        match self.history.pop() {
            Some(snapshot) => {
                self.working = snapshot.bytes;
                self.notice = Some("Last action undone".to_string());
                UndoOutcome::Restored(snapshot.replaced_by)
            }
            None => {
                self.notice = Some("Nothing to undo".to_string());
                UndoOutcome::NothingToUndo
            }
        }
    }

    /// Drop every edit and reload the original artifact.
    pub fn reset(&mut self) {
        self.working = self.original.clone();
        self.history.clear();
        self.active = None;
        self.notice = Some("Document reset".to_string());
    }

    /// Bytes to submit for signing. Requires at least one confirmed embed.
    pub fn finalize(&self) -> Result<Vec<u8>, SessionError> {
        if let Some(active) = &self.active {
            return Err(SessionError::AnotherFieldActive(active.kind));
        }
        if !self.has_edits() {
            return Err(SessionError::NothingToSubmit);
        }
        Ok(self.working.clone())
    }

    pub fn view(&self) -> SessionView<'_> {
        SessionView {
            page_count: self.page_count,
            history_depth: self.history.len(),
            has_edits: self.has_edits(),
            active: self.active.as_ref(),
            can_submit: self.active.is_none() && self.has_edits(),
            notice: self.notice.as_deref(),
        }
    }

    pub fn render<P: SessionPresenter>(&self, presenter: &P) -> P::Output {
        presenter.render(&self.view())
    }
}

fn build_request(active: &ActiveField, viewport: Viewport, now: &DateTime<Local>) -> EmbedRequest {
    let placement = Placement {
        page: PageTarget::Index(active.page_index),
        anchor: Some(active.position),
        viewport,
        page_size: None,
        content_height_px: active.kind.content_height_px(),
    };
    match &active.payload {
        FieldPayload::Image(bytes) => EmbedRequest {
            placement,
            content: AnnotationContent::Image {
                bytes: bytes.clone(),
                size: ImageSize::Exact {
                    width: SIGNATURE_WIDTH_PT,
                    height: SIGNATURE_HEIGHT_PT,
                },
            },
            captions: vec![Caption {
                text: signed_caption(now),
                font_size: 10.0,
                color: SIGNATURE_CAPTION_GREY,
                position: CaptionPosition::Below(15.0),
            }],
        },
        FieldPayload::Text(text) => EmbedRequest {
            placement,
            content: AnnotationContent::Text {
                text: text.clone(),
                font_size: DEFAULT_FONT_SIZE,
                color: Rgb::BLACK,
            },
            captions: Vec::new(),
        },
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect::<String>().replace('_', " "),
        None => String::new(),
    }
}

/// Read-only snapshot handed to presenters.
#[derive(Debug, Clone, Copy)]
pub struct SessionView<'a> {
    pub page_count: usize,
    pub history_depth: usize,
    /// Working copy differs from the original, including embeds that fell
    /// off a capped history.
    pub has_edits: bool,
    pub active: Option<&'a ActiveField>,
    pub can_submit: bool,
    pub notice: Option<&'a str>,
}

pub trait SessionPresenter {
    type Output;

    fn render(&self, view: &SessionView<'_>) -> Self::Output;
}

/// Renders the session as a tree of JSON UI nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonPresenter;

impl SessionPresenter for JsonPresenter {
    type Output = Value;

    fn render(&self, view: &SessionView<'_>) -> Value {
        let pages = format!("Pages: {}", view.page_count);
        let mut children = vec![
            to_value_or_text(UiText::new("Sign document").size(20.0), "annotation_title"),
            to_value_or_text(UiText::new(&pages).size(12.0), "annotation_pages"),
        ];

        match view.active {
            Some(active) => {
                children.push(to_value_or_text(
                    FieldOverlay::new(active.kind.as_str(), active.page_index, active.position.x, active.position.y),
                    "annotation_overlay",
                ));
            }
            None => {
                for kind in FieldKind::ALL {
                    let action = format!("annotation_begin:{}", kind.as_str());
                    let label = format!("Add {}", kind.as_str().replace('_', " "));
                    children.push(to_value_or_text(UiButton::new(&label, &action), "annotation_begin"));
                }
            }
        }

        let undo_label = format!("Undo ({})", view.history_depth);
        children.push(to_value_or_text(
            UiButton::new(&undo_label, "annotation_undo").disabled(view.history_depth == 0),
            "annotation_undo",
        ));
        children.push(to_value_or_text(
            UiButton::new("Reset", "annotation_reset").disabled(!view.has_edits && view.active.is_none()),
            "annotation_reset",
        ));
        children.push(to_value_or_text(
            UiButton::new("Submit signed document", "annotation_submit").disabled(!view.can_submit),
            "annotation_submit",
        ));

        if let Some(notice) = view.notice {
            children.push(to_value_or_text(
                UiText::new(notice).size(12.0).content_description("annotation_notice"),
                "annotation_notice",
            ));
        }

        to_value_or_text(UiColumn::new(children).padding(20), "annotation_root")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::pdf::page_sizes;
    use crate::test_support::{blank_pdf, png_bytes};
    use chrono::TimeZone;

    fn session(pages: usize) -> AnnotationSession {
        AnnotationSession::new(blank_pdf(pages, 612.0, 792.0), Viewport::new(800.0, 1035.0)).unwrap()
    }

    fn fixed_now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 10, 19, 14, 30, 0).unwrap()
    }

    #[test]
    fn n_embeds_then_n_undos_restore_original_bytes() {
        let mut s = session(2);
        let original = s.original().to_vec();

        s.begin(FieldKind::Signature, 0, FieldPayload::Image(png_bytes(30, 15))).unwrap();
        s.move_to(ScreenPoint::new(120.0, 640.0)).unwrap();
        s.confirm_at(fixed_now()).unwrap();
        s.begin(FieldKind::Name, 1, FieldPayload::Text("Jane Signer".into())).unwrap();
        s.confirm_at(fixed_now()).unwrap();
        s.begin(FieldKind::Date, 1, FieldPayload::date(&fixed_now())).unwrap();
        s.confirm_at(fixed_now()).unwrap();
        assert_eq!(s.history_depth(), 3);
        assert!(s.has_edits());

        for _ in 0..3 {
            assert!(matches!(s.undo(), UndoOutcome::Restored(_)));
        }
        assert_eq!(s.working_copy(), original.as_slice());
        assert_eq!(s.undo(), UndoOutcome::NothingToUndo);
        assert_eq!(s.notice(), Some("Nothing to undo"));
    }

    #[test]
    fn undo_returns_kinds_in_lifo_order() {
        let mut s = session(1);
        s.begin(FieldKind::Email, 0, FieldPayload::Text("signer@example.com".into())).unwrap();
        s.confirm_at(fixed_now()).unwrap();
        s.begin(FieldKind::CustomText, 0, FieldPayload::Text("Approved".into())).unwrap();
        s.confirm_at(fixed_now()).unwrap();
        assert_eq!(s.undo(), UndoOutcome::Restored(FieldKind::CustomText));
        assert_eq!(s.undo(), UndoOutcome::Restored(FieldKind::Email));
    }

    #[test]
    fn only_one_field_may_be_placing() {
        let mut s = session(1);
        s.begin(FieldKind::Name, 0, FieldPayload::Text("Jane".into())).unwrap();
        let err = s.begin(FieldKind::Email, 0, FieldPayload::Text("jane@example.com".into())).unwrap_err();
        assert!(matches!(err, SessionError::AnotherFieldActive(FieldKind::Name)));
        assert_eq!(s.phase(FieldKind::Name), FieldPhase::Placing);
        assert_eq!(s.phase(FieldKind::Email), FieldPhase::Idle);
    }

    #[test]
    fn cancel_discards_without_touching_working_copy() {
        let mut s = session(1);
        s.begin(FieldKind::Signature, 0, FieldPayload::Image(png_bytes(4, 4))).unwrap();
        assert_eq!(s.cancel(), Some(FieldKind::Signature));
        assert_eq!(s.cancel(), None);
        assert!(!s.has_edits());
        assert_eq!(s.history_depth(), 0);
        assert!(matches!(s.confirm_at(fixed_now()), Err(SessionError::NothingPlacing)));
    }

    #[test]
    fn failed_confirm_keeps_state_and_field() {
        let mut s = session(1);
        s.begin(FieldKind::Signature, 0, FieldPayload::Image(b"not an image".to_vec())).unwrap();
        let err = s.confirm_at(fixed_now()).unwrap_err();
        assert!(matches!(err, SessionError::Embed(EmbedError::UnsupportedImage)));
        assert_eq!(s.phase(FieldKind::Signature), FieldPhase::Placing);
        assert_eq!(s.history_depth(), 0);
        assert_eq!(s.working_copy(), s.original());
    }

    #[test]
    fn payload_must_match_kind() {
        let mut s = session(1);
        assert!(matches!(
            s.begin(FieldKind::Signature, 0, FieldPayload::Text("x".into())),
            Err(SessionError::PayloadMismatch { expected: "image", .. })
        ));
        assert!(matches!(
            s.begin(FieldKind::Name, 0, FieldPayload::Image(vec![1])),
            Err(SessionError::PayloadMismatch { expected: "text", .. })
        ));
        assert!(matches!(
            s.begin(FieldKind::Name, 0, FieldPayload::Text("  ".into())),
            Err(SessionError::Embed(EmbedError::EmptyText))
        ));
        assert!(matches!(
            s.begin(FieldKind::Name, 3, FieldPayload::Text("Jane".into())),
            Err(SessionError::Embed(EmbedError::PageOutOfRange { index: 3, count: 1 }))
        ));
    }

    #[test]
    fn reset_reloads_original_and_clears_history() {
        let mut s = session(1);
        s.begin(FieldKind::Name, 0, FieldPayload::Text("Jane".into())).unwrap();
        s.confirm_at(fixed_now()).unwrap();
        s.begin(FieldKind::Email, 0, FieldPayload::Text("jane@example.com".into())).unwrap();
        s.reset();
        assert_eq!(s.working_copy(), s.original());
        assert_eq!(s.history_depth(), 0);
        assert!(s.active().is_none());
        assert!(matches!(s.finalize(), Err(SessionError::NothingToSubmit)));
    }

    #[test]
    fn history_limit_drops_oldest_snapshot() {
        let mut s = session(1).with_history_limit(Some(2));
        for name in ["A", "B", "C"] {
            s.begin(FieldKind::CustomText, 0, FieldPayload::Text(name.into())).unwrap();
            s.confirm_at(fixed_now()).unwrap();
        }
        assert_eq!(s.history_depth(), 2);
        s.undo();
        s.undo();
        assert_eq!(s.undo(), UndoOutcome::NothingToUndo);
        // The first embed fell off the stack and stays applied.
        assert!(s.has_edits());
        assert!(s.finalize().is_ok());
    }

    #[test]
    fn reset_stays_enabled_while_capped_history_is_exhausted() {
        fn button_disabled(screen: &Value, action: &str) -> bool {
            screen
                .get("children")
                .and_then(|c| c.as_array())
                .and_then(|children| {
                    children
                        .iter()
                        .find(|c| c.get("action").and_then(|a| a.as_str()) == Some(action))
                })
                .and_then(|b| b.get("disabled"))
                .and_then(|d| d.as_bool())
                .unwrap_or(false)
        }

        let mut s = session(1).with_history_limit(Some(1));
        assert!(button_disabled(&s.render(&JsonPresenter), "annotation_reset"));

        for name in ["A", "B"] {
            s.begin(FieldKind::CustomText, 0, FieldPayload::Text(name.into())).unwrap();
            s.confirm_at(fixed_now()).unwrap();
        }
        s.undo();
        assert_eq!(s.history_depth(), 0);

        let screen = s.render(&JsonPresenter);
        assert!(button_disabled(&screen, "annotation_undo"));
        assert!(!button_disabled(&screen, "annotation_reset"));

        s.reset();
        assert!(button_disabled(&s.render(&JsonPresenter), "annotation_reset"));
    }

    #[test]
    fn finalize_refuses_while_placing() {
        let mut s = session(1);
        s.begin(FieldKind::Name, 0, FieldPayload::Text("Jane".into())).unwrap();
        s.confirm_at(fixed_now()).unwrap();
        s.begin(FieldKind::Date, 0, FieldPayload::date(&fixed_now())).unwrap();
        assert!(matches!(s.finalize(), Err(SessionError::AnotherFieldActive(FieldKind::Date))));
        s.cancel();
        let bytes = s.finalize().unwrap();
        assert_eq!(page_sizes(&bytes).unwrap(), page_sizes(s.original()).unwrap());
    }

    #[test]
    fn json_presenter_reflects_session_state() {
        let mut s = session(3);
        let idle = s.render(&JsonPresenter);
        let children = idle.get("children").and_then(|c| c.as_array()).unwrap();
        let begin_buttons = children
            .iter()
            .filter(|c| {
                c.get("action")
                    .and_then(|a| a.as_str())
                    .map(|a| a.starts_with("annotation_begin:"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(begin_buttons, FieldKind::ALL.len());

        s.begin(FieldKind::Signature, 2, FieldPayload::Image(png_bytes(4, 4))).unwrap();
        let placing = s.render(&JsonPresenter);
        let children = placing.get("children").and_then(|c| c.as_array()).unwrap();
        let overlay = children
            .iter()
            .find(|c| c.get("type").and_then(|t| t.as_str()) == Some("FieldOverlay"))
            .unwrap();
        assert_eq!(overlay.get("page").and_then(|p| p.as_u64()), Some(2));
        assert_eq!(overlay.get("x").and_then(|p| p.as_f64()), Some(300.0));
        let submit = children
            .iter()
            .find(|c| c.get("action").and_then(|a| a.as_str()) == Some("annotation_submit"))
            .unwrap();
        assert_eq!(submit.get("disabled").and_then(|d| d.as_bool()), Some(true));
    }

    #[test]
    fn confirm_reports_draw_rect_from_viewport() {
        let mut s = session(1);
        s.set_viewport(Viewport::new(800.0, 900.0));
        s.begin(FieldKind::Signature, 0, FieldPayload::Image(png_bytes(4, 4))).unwrap();
        let rect = s.confirm_at(fixed_now()).unwrap();
        let scale_y = 792.0 / 900.0;
        assert!((rect.x - 229.5).abs() < 1e-9);
        assert_eq!(rect.y, 792.0 - (200.0 * scale_y) - (60.0 * scale_y));
        assert_eq!((rect.width, rect.height), (SIGNATURE_WIDTH_PT, SIGNATURE_HEIGHT_PT));
        assert_eq!(s.notice(), Some("Signature embedded"));
    }
}
