pub mod config;
pub mod images;
pub mod providers;
pub mod request;
pub mod service;
pub mod session;

pub use config::AnalyzerConfig;
pub use images::{StagedImage, StagingArea, MAX_STAGED_IMAGES};
pub use request::build_analysis_request;
pub use service::{AnalysisService, PendingAnalysis};
pub use session::{ChatSession, ChatTurn, Completion, TurnContent};
