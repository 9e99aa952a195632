use crate::error::IngestError;
use crate::traits::PageRenderer;
use image::DynamicImage;
use pdfium_render::prelude::*;

/// Longest rendered edge, in pixels.
const MAX_DIMENSION_PX: u32 = 4096;

/// Rasterizes whole pages through a PDFium shared library, so text and
/// vector content renders the same way a viewer shows it.
///
/// `Pdfium` is `!Send`, so a binding is made per call; the dynamic loader
/// caches the library after the first one.
pub struct PdfiumRenderer {
    bytes: Vec<u8>,
}

impl PdfiumRenderer {
    /// Fails with [`IngestError::RendererUnavailable`] when no library binds.
    ///
    /// Lookup order: `PDFIUM_DYNAMIC_LIB_PATH`, the executable's directory,
    /// then the system library path.
    pub fn new(bytes: Vec<u8>) -> Result<Self, IngestError> {
        bind_pdfium()?;
        Ok(Self { bytes })
    }
}

fn bind_pdfium() -> Result<Pdfium, IngestError> {
    if let Ok(path) = std::env::var("PDFIUM_DYNAMIC_LIB_PATH") {
        let bindings = Pdfium::bind_to_library(&path).map_err(|error| {
            IngestError::RendererUnavailable(format!("cannot load {path}: {error}"))
        })?;
        return Ok(Pdfium::new(bindings));
    }

    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
    {
        let library = Pdfium::pdfium_platform_library_name_at_path(dir.to_string_lossy().as_ref());
        if let Ok(bindings) = Pdfium::bind_to_library(&library) {
            tracing::debug!(dir = %dir.display(), "bound pdfium next to executable");
            return Ok(Pdfium::new(bindings));
        }
    }

    let bindings = Pdfium::bind_to_system_library().map_err(|error| {
        IngestError::RendererUnavailable(format!(
            "set PDFIUM_DYNAMIC_LIB_PATH or install pdfium: {error}"
        ))
    })?;
    Ok(Pdfium::new(bindings))
}

/// Pixel size for a page of `width` x `height` points at `scale`, with the
/// longer edge capped at [`MAX_DIMENSION_PX`].
fn target_dimensions(width: f32, height: f32, scale: f32) -> (u32, u32) {
    let raw_width = (width * scale).max(1.0);
    let raw_height = (height * scale).max(1.0);
    let longest = raw_width.max(raw_height);

    let ratio = if longest > MAX_DIMENSION_PX as f32 {
        MAX_DIMENSION_PX as f32 / longest
    } else {
        1.0
    };
    let clamp = |value: f32| ((value * ratio).round() as u32).clamp(1, MAX_DIMENSION_PX);
    (clamp(raw_width), clamp(raw_height))
}

impl PageRenderer for PdfiumRenderer {
    fn render_page(&self, page: u32, scale: f32) -> Result<DynamicImage, IngestError> {
        let pdfium = bind_pdfium()?;
        let document = pdfium
            .load_pdf_from_byte_slice(&self.bytes, None)
            .map_err(|error| IngestError::PdfParse(error.to_string()))?;
        let pages = document.pages();
        let total = pages.len() as usize;
        let out_of_range = IngestError::PageOutOfRange { page, total };

        let Some(index) = page.checked_sub(1).and_then(|index| u16::try_from(index).ok()) else {
            return Err(out_of_range);
        };
        let pdf_page = pages.get(index).map_err(|_| out_of_range)?;

        let (width, height) = target_dimensions(pdf_page.width().value, pdf_page.height().value, scale);
        let config = PdfRenderConfig::new()
            .set_target_width(width as i32)
            .set_maximum_height(height as i32);
        let bitmap = pdf_page
            .render_with_config(&config)
            .map_err(|error| IngestError::RenderFailed {
                page,
                reason: error.to_string(),
            })?;

        let image = bitmap.as_image();
        tracing::debug!(page, width, height, "rendered page with pdfium");
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letter_page_doubles_at_scale_two() {
        assert_eq!(target_dimensions(612.0, 792.0, 2.0), (1224, 1584));
    }

    #[test]
    fn oversized_page_is_capped_keeping_aspect() {
        let (width, height) = target_dimensions(5_000.0, 2_500.0, 2.0);

        assert_eq!(width, MAX_DIMENSION_PX);
        assert_eq!(height, MAX_DIMENSION_PX / 2);
    }

    #[test]
    fn degenerate_page_still_has_a_pixel() {
        assert_eq!(target_dimensions(0.0, 0.0, 2.0), (1, 1));
    }
}
