//! ScreenText - batch image-to-text extraction
//!
//! Pick images, run OCR over them with a single amortized engine (or one per
//! worker), and get back one outcome per image in input order.

pub mod acquire;
pub mod config;
pub mod error;
pub mod extract;
pub mod storage;
pub mod vision;

pub use acquire::{ImageCollection, ImageHandle, ImagePicker, ImageSource};
pub use config::AppConfig;
pub use error::{AcquisitionError, ConfigurationError, ErrorKind, ImageError};
pub use extract::{
    BatchExtractor, BatchStatus, EngineStrategy, ExtractOptions, ExtractionResult, PerImageOutcome,
};
pub use vision::{EngineMode, EngineSpec, RecognitionEngine};
