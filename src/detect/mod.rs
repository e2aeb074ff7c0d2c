mod backend;
mod backends;
mod result;
mod worker;

pub use backend::Recognizer;
pub use backends::StubRecognizer;
pub use result::{BoundingBox, DetectionEvent, DetectionHandler, Recognition};
pub use worker::{DetectionWorker, WorkerSettings};
