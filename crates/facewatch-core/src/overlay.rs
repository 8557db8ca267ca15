//! Annotation rendering onto the overlay surface.

use crate::types::{BoundingBox, DisplayGeometry, MatchResult, PipelineState};
use ab_glyph::{FontVec, PxScale};
use image::{Rgba, RgbaImage};
use imageproc::drawing;
use imageproc::rect::Rect;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

const KNOWN_COLOR: Rgba<u8> = Rgba([0, 200, 255, 255]);
const UNKNOWN_COLOR: Rgba<u8> = Rgba([255, 80, 80, 255]);
const TEXT_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const LABEL_HEIGHT: u32 = 18;
const LABEL_SCALE: f32 = 15.0;

/// A face box with its match, in display coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Annotation {
    pub bbox: BoundingBox,
    pub result: MatchResult,
}

impl Annotation {
    /// Text drawn next to the box, e.g. `alice (0.42)`.
    pub fn text(&self) -> String {
        self.result.to_string()
    }
}

/// Drawable surface aligned to the display geometry.
pub trait Overlay: Send {
    fn clear(&mut self);
    fn draw(&mut self, annotation: &Annotation);
}

/// Overlay shared between the writer task and readers.
pub type SharedOverlay = Arc<Mutex<dyn Overlay>>;

/// Transparent RGBA overlay that also remembers what was drawn on it.
pub struct Canvas {
    image: RgbaImage,
    annotations: Vec<Annotation>,
    font: Option<FontVec>,
}

impl Canvas {
    pub fn new(geometry: DisplayGeometry) -> Self {
        Self {
            image: RgbaImage::new(geometry.width, geometry.height),
            annotations: Vec::new(),
            font: None,
        }
    }

    /// Render label text with `font`. Without a font only the label tab is drawn.
    pub fn with_font(mut self, font: FontVec) -> Self {
        self.font = Some(font);
        self
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    /// Clip a box to the canvas; `None` when nothing of it is visible.
    fn clip(&self, bbox: &BoundingBox) -> Option<Rect> {
        let (w, h) = (self.image.width() as f32, self.image.height() as f32);
        let x0 = bbox.x.max(0.0);
        let y0 = bbox.y.max(0.0);
        let x1 = (bbox.x + bbox.width).min(w);
        let y1 = (bbox.y + bbox.height).min(h);
        if x1 - x0 < 1.0 || y1 - y0 < 1.0 {
            return None;
        }
        Some(Rect::at(x0 as i32, y0 as i32).of_size((x1 - x0) as u32, (y1 - y0) as u32))
    }
}

impl Overlay for Canvas {
    fn clear(&mut self) {
        self.image.pixels_mut().for_each(|p| *p = Rgba([0, 0, 0, 0]));
        self.annotations.clear();
    }

    fn draw(&mut self, annotation: &Annotation) {
        self.annotations.push(annotation.clone());

        let Some(rect) = self.clip(&annotation.bbox) else {
            return;
        };
        let color = if annotation.result.is_known() {
            KNOWN_COLOR
        } else {
            UNKNOWN_COLOR
        };
        drawing::draw_hollow_rect_mut(&mut self.image, rect, color);

        // Label tab under the box, pulled inside the canvas when the box touches the bottom.
        let tab_y = (rect.bottom() + 1).min(self.image.height() as i32 - LABEL_HEIGHT as i32).max(0);
        let tab = Rect::at(rect.left(), tab_y).of_size(rect.width(), LABEL_HEIGHT);
        drawing::draw_filled_rect_mut(&mut self.image, tab, color);

        if let Some(font) = &self.font {
            drawing::draw_text_mut(
                &mut self.image,
                TEXT_COLOR,
                rect.left() + 2,
                tab_y + 1,
                PxScale::from(LABEL_SCALE),
                font,
                &annotation.text(),
            );
        }
    }
}

/// Writes annotation passes to the overlay, but only while capturing.
pub struct AnnotationRenderer {
    overlay: SharedOverlay,
    state: watch::Receiver<PipelineState>,
}

impl AnnotationRenderer {
    pub fn new(overlay: SharedOverlay, state: watch::Receiver<PipelineState>) -> Self {
        Self { overlay, state }
    }

    /// Clear the overlay and draw `annotations`.
    ///
    /// The state is read with the overlay lock held, so a stop that lands
    /// before this call leaves the overlay untouched. Returns whether
    /// anything was written.
    pub fn render(&self, annotations: &[Annotation]) -> bool {
        let mut overlay = match self.overlay.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *self.state.borrow() != PipelineState::Capturing {
            tracing::debug!("discarding render: no longer capturing");
            return false;
        }
        overlay.clear();
        for annotation in annotations {
            overlay.draw(annotation);
        }
        true
    }
}

/// Clear a shared overlay, tolerating a poisoned lock.
pub fn clear_overlay(overlay: &SharedOverlay) {
    let mut guard = match overlay.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.clear();
}
