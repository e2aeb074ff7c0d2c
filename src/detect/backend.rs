use anyhow::Result;

use crate::detect::result::Recognition;
use crate::frame::FrameSample;

/// Face recognizer backend.
///
/// The recognition algorithm (face detection, embedding, angle/lighting/quality scoring)
/// lives behind this trait. One recognizer instance is shared by every camera's
/// detection worker, so implementations take `&self` and synchronize internally.
///
/// Return values:
/// - `Ok(None)`: no face in the frame.
/// - `Ok(Some(r))` with `r.employee_id == None`: a face was seen but not matched.
/// - `Err(_)`: recognition failed for this frame. Workers treat it like `Ok(None)`.
pub trait Recognizer: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    fn recognize(&self, frame: &FrameSample, camera_id: &str) -> Result<Option<Recognition>>;

    /// Optional warm-up hook, called once before monitoring starts.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}
