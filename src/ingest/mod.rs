//! Camera ingestion.
//!
//! A `CameraTransport` opens a camera URI into a `FrameStream`; the `TransportRegistry`
//! picks the transport by URI scheme. One `FrameSource` per camera drives the stream,
//! handles reconnects, and publishes frames into the camera's `FrameQueue`.
//!
//! Raw pixels never leave the process: they are not written to disk and not logged.

mod source;
mod synthetic;
mod transport;

pub use source::{FrameSource, ReconnectPolicy, SourceState};
pub use synthetic::SyntheticTransport;
pub use transport::{CameraTransport, CapturedImage, FrameStream, TransportRegistry};
