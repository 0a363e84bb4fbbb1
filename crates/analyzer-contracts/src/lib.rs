pub mod chat;
pub mod error;
pub mod events;
pub mod prompt;
pub mod segmentation;

pub use error::{AnalysisError, AnalysisResult};
