use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::config::CameraConfig;

/// A decoded image as delivered by a transport, before it is stamped into a `FrameSample`.
pub struct CapturedImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// An open camera connection.
///
/// `next_frame` blocks until the next image is available. An `Err` is a read failure;
/// the caller decides whether it is transient or forces a reconnect.
pub trait FrameStream: Send {
    fn next_frame(&mut self) -> Result<CapturedImage>;
}

/// Opens camera connections for one URI scheme.
pub trait CameraTransport: Send + Sync {
    fn scheme(&self) -> &'static str;

    fn open(&self, camera: &CameraConfig) -> Result<Box<dyn FrameStream>>;
}

/// Scheme-keyed registry of camera transports.
pub struct TransportRegistry {
    transports: HashMap<String, Arc<dyn CameraTransport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            transports: HashMap::new(),
        }
    }

    /// Registry with the built-in `stub://` transport.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(super::SyntheticTransport::new()));
        registry
    }

    /// Register a transport under its scheme. A later registration replaces an earlier one.
    pub fn register(&mut self, transport: Arc<dyn CameraTransport>) {
        self.transports
            .insert(transport.scheme().to_string(), transport);
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn CameraTransport>> {
        self.transports.get(scheme).cloned()
    }

    /// List registered schemes.
    pub fn list(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.transports.keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Resolve the transport for a camera's source URI.
    pub fn resolve(&self, source_uri: &str) -> Result<Arc<dyn CameraTransport>> {
        let scheme = uri_scheme(source_uri)?;
        self.get(scheme)
            .ok_or_else(|| anyhow!("no transport registered for scheme '{}'", scheme))
    }

    pub fn open(&self, camera: &CameraConfig) -> Result<Box<dyn FrameStream>> {
        self.resolve(&camera.source_uri)?.open(camera)
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn uri_scheme(uri: &str) -> Result<&str> {
    match uri.split_once("://") {
        Some((scheme, _)) if !scheme.is_empty() => Ok(scheme),
        _ => Err(anyhow!("source uri '{}' has no scheme", uri)),
    }
}
