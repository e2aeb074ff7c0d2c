use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::Recognizer;
use crate::detect::result::{BoundingBox, Recognition};
use crate::frame::FrameSample;

/// Stub recognizer for demos and tests. Uses pixel hashing to pick an employee.
///
/// The result is a pure function of the frame content: roughly one frame in four has
/// no face, one in eight has an unknown face, the rest map onto the roster.
pub struct StubRecognizer {
    roster: Vec<String>,
}

impl StubRecognizer {
    pub fn new(roster: Vec<String>) -> Self {
        Self { roster }
    }
}

impl Recognizer for StubRecognizer {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn recognize(&self, frame: &FrameSample, _camera_id: &str) -> Result<Option<Recognition>> {
        let digest: [u8; 32] = Sha256::digest(frame.pixels()).into();

        if self.roster.is_empty() || digest[0] % 4 == 0 {
            return Ok(None);
        }

        let confidence = 0.5 + f32::from(digest[1] % 50) / 100.0;
        let bounding_box = BoundingBox::new(
            f32::from(digest[2] % 60) / 100.0,
            f32::from(digest[3] % 60) / 100.0,
            0.2,
            0.3,
        );
        let employee_id = if digest[4] % 8 == 0 {
            None
        } else {
            Some(self.roster[digest[5] as usize % self.roster.len()].clone())
        };

        Ok(Some(Recognition {
            employee_id,
            confidence,
            bounding_box,
        }))
    }
}
