use crate::config::ExtractionConfig;
use crate::error::IngestError;
use crate::models::PageImage;
use crate::pdfium::PdfiumRenderer;
use crate::traits::{PageRenderer, PageSize, PageSource};
use base64::{engine::general_purpose::STANDARD, Engine};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageOutputFormat};
use lopdf::{Dictionary, Document, Object, ObjectId};
use std::io::Cursor;
use std::path::Path;

const LETTER: PageSize = PageSize {
    width: 612.0,
    height: 792.0,
};
const MAX_INHERITANCE_DEPTH: usize = 32;

/// A parsed PDF. Pages render through PDFium when the library is present;
/// otherwise, or when PDFium fails, the largest embedded image XObject on the
/// page is used, which covers scanner output.
pub struct PdfDocument {
    document: Document,
    pages: Vec<ObjectId>,
    rasterizer: Option<Box<dyn PageRenderer + Send + Sync>>,
}

impl PdfDocument {
    pub fn open(path: &Path) -> Result<Self, IngestError> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IngestError> {
        let document =
            Document::load_mem(bytes).map_err(|error| IngestError::PdfParse(error.to_string()))?;
        let pdf = Self::from_document(document);

        Ok(match PdfiumRenderer::new(bytes.to_vec()) {
            Ok(renderer) => pdf.with_rasterizer(renderer),
            Err(error) => {
                tracing::warn!(%error, "rendering from embedded images only");
                pdf
            }
        })
    }

    pub fn from_document(document: Document) -> Self {
        let pages = document.get_pages().into_values().collect();
        Self {
            document,
            pages,
            rasterizer: None,
        }
    }

    pub fn with_rasterizer(mut self, rasterizer: impl PageRenderer + Send + Sync + 'static) -> Self {
        self.rasterizer = Some(Box::new(rasterizer));
        self
    }

    fn page_id(&self, page: u32) -> Result<ObjectId, IngestError> {
        (page as usize)
            .checked_sub(1)
            .and_then(|index| self.pages.get(index))
            .copied()
            .ok_or(IngestError::PageOutOfRange {
                page,
                total: self.pages.len(),
            })
    }

    /// Looks up `key` on the page, walking `/Parent` links for inherited
    /// attributes such as `/MediaBox` and `/Resources`.
    fn inherited(&self, page_id: ObjectId, key: &[u8]) -> Option<&Object> {
        let mut current = self.document.get_dictionary(page_id).ok()?;
        for _ in 0..MAX_INHERITANCE_DEPTH {
            if let Ok(value) = current.get(key) {
                return Some(self.resolve(value));
            }
            let parent = current.get(b"Parent").ok()?.as_reference().ok()?;
            current = self.document.get_dictionary(parent).ok()?;
        }
        None
    }

    fn resolve<'a>(&'a self, object: &'a Object) -> &'a Object {
        match object {
            Object::Reference(id) => self.document.get_object(*id).unwrap_or(object),
            _ => object,
        }
    }

    fn largest_image(&self, page: u32) -> Result<DynamicImage, IngestError> {
        let page_id = self.page_id(page)?;
        let resources = self
            .inherited(page_id, b"Resources")
            .and_then(|object| object.as_dict().ok())
            .ok_or(IngestError::NothingToRender(page))?;
        let xobjects = resources
            .get(b"XObject")
            .ok()
            .map(|object| self.resolve(object))
            .and_then(|object| object.as_dict().ok())
            .ok_or(IngestError::NothingToRender(page))?;

        let mut largest: Option<DynamicImage> = None;
        for (_name, object) in xobjects.iter() {
            let stream = match self.resolve(object) {
                Object::Stream(stream) => stream,
                _ => continue,
            };
            if !is_image(&stream.dict) {
                continue;
            }

            let decoded = match decode_image_stream(stream) {
                Ok(decoded) => decoded,
                Err(error) => {
                    tracing::debug!(page, %error, "skipping undecodable image");
                    continue;
                }
            };
            let pixels = |image: &DynamicImage| {
                let (width, height) = image.dimensions();
                u64::from(width) * u64::from(height)
            };
            if largest.as_ref().map_or(true, |prev| pixels(&decoded) > pixels(prev)) {
                largest = Some(decoded);
            }
        }

        largest.ok_or(IngestError::NothingToRender(page))
    }
}

impl PageSource for PdfDocument {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page_text(&self, page: u32) -> Result<String, IngestError> {
        self.page_id(page)?;
        self.document
            .extract_text(&[page])
            .map_err(|error| IngestError::PdfParse(error.to_string()))
    }

    fn page_size(&self, page: u32) -> Result<PageSize, IngestError> {
        let page_id = self.page_id(page)?;
        let media_box = self
            .inherited(page_id, b"MediaBox")
            .and_then(|object| object.as_array().ok())
            .map(|values| {
                values
                    .iter()
                    .map(|value| self.resolve(value).as_float().unwrap_or(0.0))
                    .collect::<Vec<_>>()
            });

        Ok(match media_box.as_deref() {
            Some([x0, y0, x1, y1]) => PageSize {
                width: (x1 - x0).abs(),
                height: (y1 - y0).abs(),
            },
            _ => LETTER,
        })
    }
}

impl PageRenderer for PdfDocument {
    fn render_page(&self, page: u32, scale: f32) -> Result<DynamicImage, IngestError> {
        if let Some(rasterizer) = &self.rasterizer {
            match rasterizer.render_page(page, scale) {
                Ok(image) => return Ok(image),
                Err(error @ IngestError::PageOutOfRange { .. }) => return Err(error),
                Err(error) => {
                    tracing::warn!(page, %error, "full-page render failed; trying embedded images")
                }
            }
        }

        let image = self.largest_image(page)?;
        let size = self.page_size(page)?;
        let target_width = (size.width * scale).round().max(1.0) as u32;
        let target_height = (size.height * scale).round().max(1.0) as u32;
        let (width, height) = image.dimensions();

        if width > target_width || height > target_height {
            Ok(image.resize(target_width, target_height, FilterType::Triangle))
        } else {
            Ok(image)
        }
    }
}

fn is_image(dict: &Dictionary) -> bool {
    matches!(dict.get(b"Subtype"), Ok(Object::Name(name)) if name == b"Image")
}

fn has_filter(dict: &Dictionary, wanted: &[u8]) -> bool {
    match dict.get(b"Filter") {
        Ok(Object::Name(name)) => name == wanted,
        Ok(Object::Array(filters)) => filters
            .iter()
            .any(|filter| matches!(filter, Object::Name(name) if name == wanted)),
        _ => false,
    }
}

fn decode_image_stream(stream: &lopdf::Stream) -> Result<DynamicImage, IngestError> {
    if has_filter(&stream.dict, b"DCTDecode") {
        return image::load_from_memory(&stream.content)
            .map_err(|error| IngestError::Image(format!("jpeg decode failed: {error}")));
    }

    let content = stream
        .decompressed_content()
        .unwrap_or_else(|_| stream.content.clone());
    if let Ok(decoded) = image::load_from_memory(&content) {
        return Ok(decoded);
    }

    let integer = |key: &[u8]| {
        stream
            .dict
            .get(key)
            .and_then(Object::as_i64)
            .map_err(|_| IngestError::Image(format!("image is missing /{}", String::from_utf8_lossy(key))))
    };
    let width = integer(b"Width")? as u32;
    let height = integer(b"Height")? as u32;
    let gray = matches!(stream.dict.get(b"ColorSpace"), Ok(Object::Name(name)) if name == b"DeviceGray");

    let raw = if gray {
        image::GrayImage::from_raw(width, height, content).map(DynamicImage::ImageLuma8)
    } else {
        image::RgbImage::from_raw(width, height, content).map(DynamicImage::ImageRgb8)
    };
    raw.ok_or_else(|| IngestError::Image(format!("raw sample buffer does not fit {width}x{height}")))
}

/// JPEG-encodes a rendered page, stepping quality down until the base64
/// payload fits `max_image_mb` or the quality floor is reached.
pub fn encode_page_image(
    image: &DynamicImage,
    page_number: u32,
    scale: f32,
    config: &ExtractionConfig,
) -> Result<PageImage, IngestError> {
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let budget = config.max_image_bytes();
    let floor = percent(config.min_jpeg_quality);
    let step = percent(config.jpeg_quality_step).max(1);
    let mut quality = percent(config.jpeg_quality).max(floor);

    loop {
        let mut buffer = Cursor::new(Vec::new());
        rgb.write_to(&mut buffer, ImageOutputFormat::Jpeg(quality))
            .map_err(|error| IngestError::Image(format!("jpeg encode failed: {error}")))?;
        let data = STANDARD.encode(buffer.get_ref());

        if data.len() <= budget || quality <= floor {
            if data.len() > budget {
                tracing::warn!(
                    page_number,
                    bytes = data.len(),
                    budget,
                    "page image still over budget at minimum quality"
                );
            }
            return Ok(PageImage {
                page_number,
                data,
                mime_type: "image/jpeg".to_string(),
                quality: f32::from(quality) / 100.0,
                scale,
            });
        }

        quality = quality.saturating_sub(step).max(floor);
    }
}

fn percent(fraction: f32) -> u8 {
    (fraction.clamp(0.0, 1.0) * 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::{dictionary, Stream};

    fn noisy_image(width: u32, height: u32) -> DynamicImage {
        let mut seed = 7u32;
        DynamicImage::ImageRgb8(image::RgbImage::from_fn(width, height, |_, _| {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let [a, b, c, _] = seed.to_le_bytes();
            image::Rgb([a, b, c])
        }))
    }

    fn jpeg_bytes(image: &DynamicImage) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        image
            .write_to(&mut buffer, ImageOutputFormat::Jpeg(85))
            .expect("test jpeg should encode");
        buffer.into_inner()
    }

    /// Two letter-sized pages: the first carries a scanned JPEG, the second is blank.
    fn scanned_pdf(jpeg: Vec<u8>, width: u32, height: u32) -> PdfDocument {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width as i64,
                "Height" => height as i64,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            },
            jpeg,
        ));
        let scanned = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Resources" => dictionary! { "XObject" => dictionary! { "Im1" => image_id } },
        });
        let blank = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![scanned.into(), blank.into()],
                "Count" => 2,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            }),
        );
        let catalog = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog);
        PdfDocument::from_document(doc)
    }

    #[test]
    fn media_box_is_inherited_from_page_tree() -> Result<(), IngestError> {
        let pdf = scanned_pdf(jpeg_bytes(&noisy_image(8, 8)), 8, 8);

        assert_eq!(pdf.page_count(), 2);
        let size = pdf.page_size(2)?;
        assert_eq!(size.width, 612.0);
        assert_eq!(size.height, 792.0);
        Ok(())
    }

    #[test]
    fn scanned_page_renders_its_embedded_image() -> Result<(), IngestError> {
        let pdf = scanned_pdf(jpeg_bytes(&noisy_image(40, 30)), 40, 30);

        let rendered = pdf.render_page(1, 2.0)?;

        assert_eq!(rendered.dimensions(), (40, 30));
        Ok(())
    }

    #[test]
    fn oversized_scan_is_scaled_to_target() -> Result<(), IngestError> {
        let pdf = scanned_pdf(jpeg_bytes(&noisy_image(1_000, 1_200)), 1_000, 1_200);

        let rendered = pdf.render_page(1, 1.0)?;

        let (width, height) = rendered.dimensions();
        assert!(width <= 612 && height <= 792);
        Ok(())
    }

    #[test]
    fn page_without_images_has_nothing_to_render() {
        let pdf = scanned_pdf(jpeg_bytes(&noisy_image(8, 8)), 8, 8);
        assert!(matches!(pdf.render_page(2, 2.0), Err(IngestError::NothingToRender(2))));
        assert!(matches!(
            pdf.page_text(3),
            Err(IngestError::PageOutOfRange { page: 3, total: 2 })
        ));
    }

    /// Paints every page a flat colour at the requested scale; fails on `broken`.
    struct FlatRasterizer {
        broken: u32,
    }

    impl PageRenderer for FlatRasterizer {
        fn render_page(&self, page: u32, scale: f32) -> Result<DynamicImage, IngestError> {
            if page == self.broken {
                return Err(IngestError::RenderFailed {
                    page,
                    reason: "corrupt content stream".to_string(),
                });
            }
            let side = (100.0 * scale) as u32;
            Ok(DynamicImage::ImageRgb8(image::RgbImage::new(side, side)))
        }
    }

    #[test]
    fn text_page_renders_through_rasterizer() -> Result<(), IngestError> {
        let pdf = scanned_pdf(jpeg_bytes(&noisy_image(8, 8)), 8, 8)
            .with_rasterizer(FlatRasterizer { broken: 1 });

        let rendered = pdf.render_page(2, 2.0)?;

        assert_eq!(rendered.dimensions(), (200, 200));
        Ok(())
    }

    #[test]
    fn failed_rasterization_falls_back_to_embedded_image() -> Result<(), IngestError> {
        let pdf = scanned_pdf(jpeg_bytes(&noisy_image(40, 30)), 40, 30)
            .with_rasterizer(FlatRasterizer { broken: 1 });

        let rendered = pdf.render_page(1, 2.0)?;

        assert_eq!(rendered.dimensions(), (40, 30));
        Ok(())
    }

    #[test]
    fn encoding_starts_at_configured_quality() -> Result<(), IngestError> {
        let page = encode_page_image(&noisy_image(32, 32), 1, 2.0, &ExtractionConfig::default())?;

        assert_eq!(page.mime_type, "image/jpeg");
        assert!((page.quality - 0.9).abs() < 1e-6);
        assert!(page.data_url().starts_with("data:image/jpeg;base64,"));
        Ok(())
    }

    #[test]
    fn quality_steps_down_to_floor_when_over_budget() -> Result<(), IngestError> {
        let config = ExtractionConfig {
            max_image_mb: 0.0001,
            ..ExtractionConfig::default()
        };

        let page = encode_page_image(&noisy_image(128, 128), 3, 2.0, &config)?;

        assert!((page.quality - 0.3).abs() < 1e-6);
        assert_eq!(page.page_number, 3);
        Ok(())
    }
}
