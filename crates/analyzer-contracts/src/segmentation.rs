pub const ANALYSIS_NOT_AVAILABLE: &str = "Analysis not available or parsing failed.";
pub const ANALYSIS_NOT_PARSED: &str =
    "Individual analysis not parsed. Full response assigned to first image.";
pub const PARSING_ERROR: &str = "Parsing error.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentationMode {
    /// No images were expected.
    Empty,
    /// No `imageK:` delimiter was present; the reply went to the first slot.
    Unsegmented,
    /// At least one delimiter was present and slots were filled by index.
    Delimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segmentation {
    pub results: Vec<String>,
    pub mode: SegmentationMode,
    /// 1-based indices whose delimiter was found.
    pub matched: Vec<usize>,
}

/// Splits one model reply into exactly `image_count` per-image results.
pub fn segment_response(text: &str, image_count: usize) -> Vec<String> {
    segment_response_detailed(text, image_count).results
}

pub fn segment_response_detailed(text: &str, image_count: usize) -> Segmentation {
    if image_count == 0 {
        return Segmentation {
            results: Vec::new(),
            mode: SegmentationMode::Empty,
            matched: Vec::new(),
        };
    }

    let mut results = vec![ANALYSIS_NOT_AVAILABLE.to_string(); image_count];
    // ASCII lowering keeps byte offsets aligned with `text`.
    let haystack = text.to_ascii_lowercase();

    let has_delimiters =
        (1..=image_count).any(|index| haystack.contains(delimiter(index).as_str()));
    if !has_delimiters {
        if !text.is_empty() {
            results[0] = text.trim().to_string();
            for slot in results.iter_mut().skip(1) {
                *slot = ANALYSIS_NOT_PARSED.to_string();
            }
        }
        return Segmentation {
            results,
            mode: SegmentationMode::Unsegmented,
            matched: Vec::new(),
        };
    }

    let mut matched = Vec::new();
    let mut cursor = 0usize;
    for index in 1..=image_count {
        let marker = delimiter(index);
        let Some(found) = find_from(&haystack, &marker, cursor) else {
            continue;
        };
        let start = found + marker.len();
        let mut end = text.len();
        if index < image_count {
            if let Some(next) = find_from(&haystack, &delimiter(index + 1), start) {
                end = next;
            }
        }

        results[index - 1] = clean_segment(&text[start..end]);
        matched.push(index);
        cursor = end;
    }

    Segmentation {
        results,
        mode: SegmentationMode::Delimited,
        matched,
    }
}

fn delimiter(index: usize) -> String {
    format!("image{index}:")
}

fn find_from(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    haystack
        .get(from..)
        .and_then(|tail| tail.find(needle))
        .map(|offset| from + offset)
}

fn clean_segment(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed.strip_suffix('.').unwrap_or(trimmed).to_string()
}
