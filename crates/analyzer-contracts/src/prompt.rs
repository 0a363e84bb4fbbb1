/// Suffix appended to every query so the reply can be split per image.
pub const DELIMITER_INSTRUCTION: &str = "Please format your response using \"image1:\", \"image2:\", etc. for each image analysis. For example:\nimage1: [analysis for first image]\nimage2: [analysis for second image]";

pub const PNG_MIME_TYPE: &str = "image/png";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    InlineData { mime_type: String, data: Vec<u8> },
    Text(String),
}

impl ContentPart {
    pub fn png(data: Vec<u8>) -> Self {
        Self::InlineData {
            mime_type: PNG_MIME_TYPE.to_string(),
            data,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.as_str()),
            Self::InlineData { .. } => None,
        }
    }
}

/// One outbound multimodal call: image parts in submission order, then the text part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub parts: Vec<ContentPart>,
}

impl AnalysisRequest {
    pub fn new(images: Vec<Vec<u8>>, query: &str) -> Self {
        let mut parts = images
            .into_iter()
            .map(ContentPart::png)
            .collect::<Vec<ContentPart>>();
        parts.push(ContentPart::Text(format_query(query)));
        Self { parts }
    }

    pub fn image_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|part| matches!(part, ContentPart::InlineData { .. }))
            .count()
    }

    pub fn text(&self) -> Option<&str> {
        self.parts.iter().rev().find_map(ContentPart::as_text)
    }
}

pub fn format_query(query: &str) -> String {
    format!("{query}\n\n{DELIMITER_INSTRUCTION}")
}
