//! Detection boxes reported by the worker.

use serde::Deserialize;

use super::geometry::Rect;

/// One detected object in a frame, as the debouncer sees it.
///
/// The worker may use its legacy field spellings (`name`, `class`, `id`,
/// `conf`) instead of, or next to, the canonical ones. When both appear the
/// canonical spelling wins.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "WireBox")]
pub struct DetectionBox {
    /// Class label, e.g. `person` or `helmet`.
    pub label: String,
    /// Numeric class index from the model, when the worker provides it.
    pub class_index: Option<i64>,
    /// Tracker-assigned id that persists across frames for the same object.
    pub track_id: Option<i64>,
    pub confidence: Option<f64>,
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

/// Class indices arrive as numbers, or as digit strings from some models.
#[derive(Deserialize)]
#[serde(untagged)]
enum ClassField {
    Index(i64),
    Text(String),
}

impl ClassField {
    fn index(self) -> Option<i64> {
        match self {
            ClassField::Index(i) => Some(i),
            ClassField::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBox {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    class_index: Option<ClassField>,
    #[serde(default)]
    class: Option<ClassField>,
    #[serde(default)]
    track_id: Option<i64>,
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    conf: Option<f64>,
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
}

impl From<WireBox> for DetectionBox {
    fn from(w: WireBox) -> Self {
        Self {
            label: w.label.or(w.name).unwrap_or_default(),
            class_index: w.class_index.or(w.class).and_then(ClassField::index),
            track_id: w.track_id.or(w.id),
            confidence: w.confidence.or(w.conf),
            x1: w.x1,
            y1: w.y1,
            x2: w.x2,
            y2: w.y2,
        }
    }
}

impl DetectionBox {
    pub fn new(label: impl Into<String>, x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            label: label.into(),
            class_index: None,
            track_id: None,
            confidence: None,
            x1,
            y1,
            x2,
            y2,
        }
    }

    pub fn with_track(mut self, track_id: i64) -> Self {
        self.track_id = Some(track_id);
        self
    }

    pub fn with_class(mut self, class_index: i64) -> Self {
        self.class_index = Some(class_index);
        self
    }

    pub fn rect(&self) -> Rect {
        Rect::new(self.x1, self.y1, self.x2, self.y2)
    }
}
