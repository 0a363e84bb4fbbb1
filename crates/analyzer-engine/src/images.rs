use std::borrow::Cow;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use analyzer_contracts::{AnalysisError, AnalysisResult};
use image::{ColorType, DynamicImage, ImageFormat};
use uuid::Uuid;

/// Upper bound on images in one submission.
pub const MAX_STAGED_IMAGES: usize = 4;

/// A picked image plus the analysis attached after a successful call.
#[derive(Debug, Clone)]
pub struct StagedImage {
    id: Uuid,
    source: Option<PathBuf>,
    bytes: Arc<[u8]>,
    bitmap: Arc<DynamicImage>,
    analysis_result: Option<String>,
}

impl StagedImage {
    pub fn from_bytes(bytes: Vec<u8>, source: Option<PathBuf>) -> AnalysisResult<Self> {
        let bitmap = image::load_from_memory(&bytes).map_err(|err| {
            let label = source
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "image data".to_string());
            AnalysisError::image_loading(format!("Could not decode {label}: {err}"))
        })?;
        Ok(Self::from_parts(bytes, bitmap, source))
    }

    pub fn from_bitmap(bitmap: DynamicImage) -> AnalysisResult<Self> {
        let bytes = encode_png(&bitmap).map_err(|err| {
            AnalysisError::image_loading(format!("Could not encode image as PNG: {err}"))
        })?;
        Ok(Self::from_parts(bytes, bitmap, None))
    }

    pub fn open(path: &Path) -> AnalysisResult<Self> {
        let bytes = fs::read(path).map_err(|err| {
            AnalysisError::image_loading(format!("Could not read {}: {err}", path.display()))
        })?;
        Self::from_bytes(bytes, Some(path.to_path_buf()))
    }

    fn from_parts(bytes: Vec<u8>, bitmap: DynamicImage, source: Option<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            bytes: Arc::from(bytes),
            bitmap: Arc::new(bitmap),
            analysis_result: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bitmap(&self) -> &DynamicImage {
        &self.bitmap
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.bitmap.width(), self.bitmap.height())
    }

    pub fn analysis_result(&self) -> Option<&str> {
        self.analysis_result.as_deref()
    }

    pub fn set_analysis_result(&mut self, result: impl Into<String>) {
        self.analysis_result = Some(result.into());
    }

    /// File name when known, otherwise a short id.
    pub fn label(&self) -> String {
        self.source
            .as_ref()
            .and_then(|path| path.file_name())
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.id.simple().to_string()[..8].to_string())
    }

    pub fn png_bytes(&self) -> image::ImageResult<Vec<u8>> {
        encode_png(&self.bitmap)
    }
}

pub(crate) fn encode_png(bitmap: &DynamicImage) -> image::ImageResult<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    png_compatible(bitmap).write_to(&mut cursor, ImageFormat::Png)?;
    Ok(cursor.into_inner())
}

/// PNG has no float samples; HDR/EXR bitmaps are narrowed to 16-bit RGBA.
fn png_compatible(bitmap: &DynamicImage) -> Cow<'_, DynamicImage> {
    match bitmap.color() {
        ColorType::Rgb32F | ColorType::Rgba32F => {
            Cow::Owned(DynamicImage::ImageRgba16(bitmap.to_rgba16()))
        }
        _ => Cow::Borrowed(bitmap),
    }
}

/// Images waiting to be submitted; holds at most [`MAX_STAGED_IMAGES`].
#[derive(Debug, Clone, Default)]
pub struct StagingArea {
    images: Vec<StagedImage>,
}

impl StagingArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps as many new images as there are free slots and returns how many were dropped.
    pub fn stage(&mut self, images: Vec<StagedImage>) -> usize {
        let available = MAX_STAGED_IMAGES.saturating_sub(self.images.len());
        let offered = images.len();
        self.images.extend(images.into_iter().take(available));
        offered.saturating_sub(available)
    }

    pub fn remove(&mut self, id: Uuid) -> Option<StagedImage> {
        let position = self.images.iter().position(|image| image.id() == id)?;
        Some(self.images.remove(position))
    }

    pub fn remove_at(&mut self, index: usize) -> Option<StagedImage> {
        (index < self.images.len()).then(|| self.images.remove(index))
    }

    pub fn take_all(&mut self) -> Vec<StagedImage> {
        std::mem::take(&mut self.images)
    }

    pub fn clear(&mut self) {
        self.images.clear();
    }

    pub fn images(&self) -> &[StagedImage] {
        &self.images
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn available_slots(&self) -> usize {
        MAX_STAGED_IMAGES.saturating_sub(self.images.len())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use image::{Rgb, Rgb32FImage, RgbImage};

    use super::*;

    /// Staged without encoding; a zero-sized bitmap cannot be written as PNG.
    pub(crate) fn unencodable_image() -> StagedImage {
        StagedImage::from_parts(Vec::new(), DynamicImage::new_rgb8(0, 0), None)
    }

    fn hdr_bytes(width: u32, height: u32) -> anyhow::Result<Vec<u8>> {
        let bitmap = DynamicImage::ImageRgb32F(Rgb32FImage::from_pixel(
            width,
            height,
            Rgb([1.5, 0.25, 0.1]),
        ));
        let mut cursor = Cursor::new(Vec::new());
        bitmap.write_to(&mut cursor, ImageFormat::Hdr)?;
        Ok(cursor.into_inner())
    }

    pub(crate) fn solid_image(width: u32, height: u32) -> StagedImage {
        let bitmap = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([200, 40, 40])));
        match StagedImage::from_bitmap(bitmap) {
            Ok(image) => image,
            Err(err) => panic!("fixture image failed: {err}"),
        }
    }

    #[test]
    fn from_bytes_decodes_png() -> anyhow::Result<()> {
        let source = solid_image(6, 4);
        let image = StagedImage::from_bytes(source.bytes().to_vec(), Some("shoe.png".into()))?;
        assert_eq!(image.dimensions(), (6, 4));
        assert_eq!(image.label(), "shoe.png");
        assert!(image.analysis_result().is_none());
        assert_ne!(image.id(), source.id());
        Ok(())
    }

    #[test]
    fn from_bytes_rejects_garbage() {
        let err = StagedImage::from_bytes(b"not an image".to_vec(), Some("bad.png".into()))
            .err()
            .map(|err| err.kind());
        assert_eq!(err, Some("image_loading"));
    }

    #[test]
    fn open_reads_file_and_reports_missing_path() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("bag.png");
        fs::write(&path, solid_image(3, 3).bytes())?;
        let image = StagedImage::open(&path)?;
        assert_eq!(image.source(), Some(path.as_path()));

        let missing = StagedImage::open(&temp.path().join("missing.png"));
        assert!(matches!(missing, Err(AnalysisError::ImageLoading(_))));
        Ok(())
    }

    #[test]
    fn png_bytes_round_trip_dimensions() -> anyhow::Result<()> {
        let image = solid_image(5, 7);
        let decoded = image::load_from_memory(&image.png_bytes()?)?;
        assert_eq!((decoded.width(), decoded.height()), (5, 7));
        Ok(())
    }

    #[test]
    fn hdr_image_stages_and_encodes_as_png() -> anyhow::Result<()> {
        let image = StagedImage::from_bytes(hdr_bytes(3, 3)?, Some("lamp.hdr".into()))?;
        assert_eq!(image.bitmap().color(), ColorType::Rgb32F);

        let png = image.png_bytes()?;
        assert_eq!(image::guess_format(&png)?, ImageFormat::Png);
        let decoded = image::load_from_memory(&png)?;
        assert_eq!((decoded.width(), decoded.height()), (3, 3));
        assert_eq!(decoded.color(), ColorType::Rgba16);
        Ok(())
    }

    #[test]
    fn float_bitmap_builds_from_bitmap() -> anyhow::Result<()> {
        let bitmap = DynamicImage::ImageRgba32F(image::Rgba32FImage::new(2, 5));
        let image = StagedImage::from_bitmap(bitmap)?;
        assert_eq!(image::load_from_memory(image.bytes())?.height(), 5);
        Ok(())
    }

    #[test]
    fn zero_sized_bitmap_fails_to_encode() {
        assert!(unencodable_image().png_bytes().is_err());
    }

    #[test]
    fn staging_keeps_first_free_slots() {
        let mut staging = StagingArea::new();
        assert_eq!(staging.stage(vec![solid_image(1, 1), solid_image(1, 1), solid_image(1, 1)]), 0);
        assert_eq!(staging.available_slots(), 1);

        let extra = vec![solid_image(2, 2), solid_image(3, 3)];
        let kept_id = extra[0].id();
        assert_eq!(staging.stage(extra), 1);
        assert_eq!(staging.len(), MAX_STAGED_IMAGES);
        assert_eq!(staging.images()[3].id(), kept_id);

        assert_eq!(staging.stage(vec![solid_image(1, 1)]), 1);
        assert_eq!(staging.len(), MAX_STAGED_IMAGES);
    }

    #[test]
    fn staging_removes_by_id_and_index() {
        let mut staging = StagingArea::new();
        let first = solid_image(1, 1);
        let second = solid_image(2, 2);
        let first_id = first.id();
        let second_id = second.id();
        staging.stage(vec![first, second]);

        assert_eq!(staging.remove(first_id).map(|image| image.id()), Some(first_id));
        assert!(staging.remove(first_id).is_none());
        assert!(staging.remove_at(5).is_none());
        assert_eq!(staging.remove_at(0).map(|image| image.id()), Some(second_id));
        assert!(staging.is_empty());
    }

    #[test]
    fn take_all_empties_staging() {
        let mut staging = StagingArea::new();
        staging.stage(vec![solid_image(1, 1), solid_image(1, 1)]);
        assert_eq!(staging.take_all().len(), 2);
        assert!(staging.is_empty());
        assert_eq!(staging.available_slots(), MAX_STAGED_IMAGES);
    }
}
