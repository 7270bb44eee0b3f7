//! Board objects and per-board mutable state.
//!
//! Only the data the synchronization core needs to move around lives here:
//! strokes, pasted images and the selection. Rendering and hit-testing are
//! handled elsewhere.

use kurbo::{Point, Rect};
use peniko::Color;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Serializable color representation (RGBA8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializableColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl SerializableColor {
    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub fn black() -> Self {
        Self::new(0, 0, 0, 255)
    }

    /// Parse `#rgb`, `#rrggbb` or `#rrggbbaa`.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.trim().strip_prefix('#')?;
        if !hex.is_ascii() {
            return None;
        }
        let channel = |s: &str| u8::from_str_radix(s, 16).ok();
        match hex.len() {
            3 => Some(Self::new(
                channel(&hex[0..1])? * 17,
                channel(&hex[1..2])? * 17,
                channel(&hex[2..3])? * 17,
                255,
            )),
            6 => Some(Self::new(
                channel(&hex[0..2])?,
                channel(&hex[2..4])?,
                channel(&hex[4..6])?,
                255,
            )),
            8 => Some(Self::new(
                channel(&hex[0..2])?,
                channel(&hex[2..4])?,
                channel(&hex[4..6])?,
                channel(&hex[6..8])?,
            )),
            _ => None,
        }
    }
}

impl Default for SerializableColor {
    fn default() -> Self {
        Self::black()
    }
}

impl From<Color> for SerializableColor {
    fn from(color: Color) -> Self {
        let rgba = color.to_rgba8();
        Self {
            r: rgba.r,
            g: rgba.g,
            b: rgba.b,
            a: rgba.a,
        }
    }
}

impl From<SerializableColor> for Color {
    fn from(color: SerializableColor) -> Self {
        Color::from_rgba8(color.r, color.g, color.b, color.a)
    }
}

/// Tool that produced a stroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineTool {
    #[default]
    Pen,
    Highlighter,
    Eraser,
}

/// A freehand stroke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineObject {
    pub id: String,
    pub tool: LineTool,
    pub points: Vec<Point>,
    pub color: SerializableColor,
    pub stroke_width: f64,
}

impl LineObject {
    /// Start a new stroke at `origin` with a fresh id.
    pub fn new(tool: LineTool, origin: Point, color: SerializableColor, stroke_width: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool,
            points: vec![origin],
            color,
            stroke_width,
        }
    }

    /// Bounding box of the stroke, padded by half the stroke width.
    pub fn bounds(&self) -> Option<Rect> {
        let first = *self.points.first()?;
        let rect = self
            .points
            .iter()
            .skip(1)
            .fold(Rect::from_points(first, first), |acc, p| acc.union_pt(*p));
        Some(rect.inflate(self.stroke_width / 2.0, self.stroke_width / 2.0))
    }
}

/// A pasted raster image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageObject {
    pub id: String,
    pub position: Point,
    pub width: f64,
    pub height: f64,
    /// Image source, usually a `data:` URL.
    pub src: String,
    #[serde(default)]
    pub locked: bool,
}

impl ImageObject {
    pub fn new(position: Point, width: f64, height: f64, src: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            position,
            width,
            height,
            src: src.into(),
            locked: false,
        }
    }

    /// Build an image whose source is a base64 `data:` URL of `data`.
    pub fn from_bytes(position: Point, width: f64, height: f64, mime_type: &str, data: &[u8]) -> Self {
        use base64::{Engine, engine::general_purpose::STANDARD};

        let src = format!("data:{};base64,{}", mime_type, STANDARD.encode(data));
        Self::new(position, width, height, src)
    }

    pub fn bounds(&self) -> Rect {
        Rect::from_origin_size(self.position, (self.width, self.height))
    }

    /// Apply the fields present in `patch`.
    pub fn apply_patch(&mut self, patch: &ImagePatch) {
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(width) = patch.width {
            self.width = width;
        }
        if let Some(height) = patch.height {
            self.height = height;
        }
    }
}

/// Partial update of an image's placement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImagePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

impl ImagePatch {
    pub fn is_empty(&self) -> bool {
        self.position.is_none() && self.width.is_none() && self.height.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Line,
    Image,
}

/// Reference to a selected board object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectedObject {
    pub id: String,
    pub kind: ObjectKind,
}

impl SelectedObject {
    pub fn line(id: impl Into<String>) -> Self {
        Self { id: id.into(), kind: ObjectKind::Line }
    }

    pub fn image(id: impl Into<String>) -> Self {
        Self { id: id.into(), kind: ObjectKind::Image }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionState {
    pub selected_objects: Vec<SelectedObject>,
    pub selection_bounds: Option<Rect>,
    #[serde(default)]
    pub is_selecting: bool,
}

impl SelectionState {
    pub fn is_empty(&self) -> bool {
        self.selected_objects.is_empty()
    }
}

/// The mutable content of one board instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardState {
    pub lines: Vec<LineObject>,
    pub images: Vec<ImageObject>,
    pub selection: SelectionState,
}

impl BoardState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(&self, id: &str) -> Option<&LineObject> {
        self.lines.iter().find(|l| l.id == id)
    }

    pub fn line_mut(&mut self, id: &str) -> Option<&mut LineObject> {
        self.lines.iter_mut().find(|l| l.id == id)
    }

    pub fn image(&self, id: &str) -> Option<&ImageObject> {
        self.images.iter().find(|i| i.id == id)
    }

    pub fn image_mut(&mut self, id: &str) -> Option<&mut ImageObject> {
        self.images.iter_mut().find(|i| i.id == id)
    }

    /// Check whether a selected-object reference still points at something.
    pub fn contains(&self, object: &SelectedObject) -> bool {
        match object.kind {
            ObjectKind::Line => self.line(&object.id).is_some(),
            ObjectKind::Image => self.image(&object.id).is_some(),
        }
    }

    /// Remove lines and images by id. Returns the number of objects removed.
    pub fn remove_objects(&mut self, line_ids: &[String], image_ids: &[String]) -> usize {
        let before = self.lines.len() + self.images.len();
        self.lines.retain(|l| !line_ids.contains(&l.id));
        self.images.retain(|i| !image_ids.contains(&i.id));
        let removed = before - (self.lines.len() + self.images.len());
        if removed > 0 {
            self.selection = validate_selection(&self.selection, self);
        }
        removed
    }

    /// Union of the bounds of every selected object.
    pub fn selected_bounds(&self) -> Option<Rect> {
        self.selection
            .selected_objects
            .iter()
            .filter_map(|obj| match obj.kind {
                ObjectKind::Line => self.line(&obj.id).and_then(LineObject::bounds),
                ObjectKind::Image => self.image(&obj.id).map(ImageObject::bounds),
            })
            .reduce(|a, b| a.union(b))
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.images.is_empty()
    }
}

/// Drop selected-object references whose target no longer exists.
///
/// Bounds are cleared when nothing survives, and an in-progress rubber-band
/// selection is never carried over.
pub fn validate_selection(selection: &SelectionState, state: &BoardState) -> SelectionState {
    let selected_objects: Vec<SelectedObject> = selection
        .selected_objects
        .iter()
        .filter(|obj| state.contains(obj))
        .cloned()
        .collect();

    let selection_bounds = if selected_objects.is_empty() {
        None
    } else {
        selection.selection_bounds
    };

    SelectionState {
        selected_objects,
        selection_bounds,
        is_selecting: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stroke(points: &[(f64, f64)]) -> LineObject {
        let mut line = LineObject::new(
            LineTool::Pen,
            Point::new(points[0].0, points[0].1),
            SerializableColor::black(),
            2.0,
        );
        line.points.extend(points[1..].iter().map(|&(x, y)| Point::new(x, y)));
        line
    }

    #[test]
    fn test_line_bounds_include_stroke_width() {
        let line = stroke(&[(0.0, 0.0), (10.0, 20.0)]);
        let bounds = line.bounds().unwrap();
        assert_eq!(bounds, Rect::new(-1.0, -1.0, 11.0, 21.0));
    }

    #[test]
    fn test_color_from_hex() {
        assert_eq!(SerializableColor::from_hex("#fff"), Some(SerializableColor::new(255, 255, 255, 255)));
        assert_eq!(SerializableColor::from_hex("#ff000080"), Some(SerializableColor::new(255, 0, 0, 128)));
        assert_eq!(SerializableColor::from_hex("red"), None);
    }

    #[test]
    fn test_image_from_bytes_builds_data_url() {
        let image = ImageObject::from_bytes(Point::ZERO, 10.0, 10.0, "image/png", b"abc");
        assert_eq!(image.src, "data:image/png;base64,YWJj");
        assert!(!image.locked);
    }

    #[test]
    fn test_validate_selection_drops_missing() {
        let line = stroke(&[(0.0, 0.0), (5.0, 5.0)]);
        let mut state = BoardState::new();
        state.lines.push(line.clone());

        let selection = SelectionState {
            selected_objects: vec![SelectedObject::line(&line.id), SelectedObject::image("gone")],
            selection_bounds: Some(Rect::new(0.0, 0.0, 5.0, 5.0)),
            is_selecting: true,
        };

        let validated = validate_selection(&selection, &state);
        assert_eq!(validated.selected_objects, vec![SelectedObject::line(&line.id)]);
        assert!(validated.selection_bounds.is_some());
        assert!(!validated.is_selecting);
    }

    #[test]
    fn test_validate_selection_clears_bounds_when_empty() {
        let state = BoardState::new();
        let selection = SelectionState {
            selected_objects: vec![SelectedObject::line("missing")],
            selection_bounds: Some(Rect::new(0.0, 0.0, 5.0, 5.0)),
            is_selecting: false,
        };

        let validated = validate_selection(&selection, &state);
        assert!(validated.is_empty());
        assert!(validated.selection_bounds.is_none());
    }

    #[test]
    fn test_remove_objects_revalidates_selection() {
        let line = stroke(&[(0.0, 0.0), (5.0, 5.0)]);
        let id = line.id.clone();
        let mut state = BoardState::new();
        state.lines.push(line);
        state.selection.selected_objects.push(SelectedObject::line(&id));
        state.selection.selection_bounds = Some(Rect::new(0.0, 0.0, 5.0, 5.0));

        assert_eq!(state.remove_objects(&[id], &[]), 1);
        assert!(state.is_empty());
        assert!(state.selection.is_empty());
        assert!(state.selection.selection_bounds.is_none());
    }

    #[test]
    fn test_image_patch() {
        let mut image = ImageObject::new(Point::ZERO, 100.0, 50.0, "data:");
        image.apply_patch(&ImagePatch {
            position: Some(Point::new(5.0, 5.0)),
            width: None,
            height: Some(25.0),
        });
        assert_eq!(image.position, Point::new(5.0, 5.0));
        assert_eq!(image.width, 100.0);
        assert_eq!(image.height, 25.0);
    }
}
