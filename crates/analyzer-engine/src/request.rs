use analyzer_contracts::prompt::AnalysisRequest;
use analyzer_contracts::{AnalysisError, AnalysisResult};

use crate::images::StagedImage;

/// Encodes every image as PNG and appends the formatted query as the final part.
///
/// The 1..=4 image bound belongs to the staging area, not to this function.
pub fn build_analysis_request(images: &[StagedImage], query: &str) -> AnalysisResult<AnalysisRequest> {
    let mut encoded = Vec::with_capacity(images.len());
    for image in images {
        let bytes = image.png_bytes().map_err(|err| {
            AnalysisError::image_loading(format!(
                "Could not get PNG data for image {}: {err}",
                image.id()
            ))
        })?;
        encoded.push(bytes);
    }
    Ok(AnalysisRequest::new(encoded, query))
}
