pub mod stub;

pub use stub::StubRecognizer;
