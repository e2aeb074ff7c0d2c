use serde::Serialize;

use crate::zones::Point;
use crate::Timestamp;

/// Face bounding box in normalized (0..1) frame coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn center(&self) -> Point {
        Point {
            x: self.x + self.w / 2.0,
            y: self.y + self.h / 2.0,
        }
    }
}

/// A single recognizer result.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Recognition {
    pub employee_id: Option<String>,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
}

/// A recognizer result tied to a camera and a capture time.
///
/// `employee_id == None` means "face seen, not recognized"; zone state ignores those.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionEvent {
    pub camera_id: String,
    pub timestamp: Timestamp,
    pub employee_id: Option<String>,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
}

/// Receiver for detection events.
pub trait DetectionHandler: Send + Sync {
    fn handle(&self, event: DetectionEvent);
}
