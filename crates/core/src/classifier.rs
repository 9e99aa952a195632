use crate::config::ExtractionConfig;
use crate::error::IngestError;
use crate::traits::PageSource;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    TextBased,
    ImageBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Low,
}

#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub kind: DocumentKind,
    pub text_density: f64,
    pub total_chars: usize,
    pub pages_sampled: usize,
    pub confidence: Confidence,
}

impl Classification {
    pub fn is_image_based(&self) -> bool {
        self.kind == DocumentKind::ImageBased
    }
}

/// Samples the first `config.sample_pages` pages and decides whether the
/// document carries a usable text layer.
pub fn classify_document(
    source: &dyn PageSource,
    config: &ExtractionConfig,
) -> Result<Classification, IngestError> {
    let total_pages = source.page_count();
    if total_pages == 0 {
        return Err(IngestError::EmptyDocument);
    }

    let pages_sampled = config.sample_pages.clamp(1, total_pages);
    let mut total_chars = 0usize;
    let mut total_area = 0f64;

    for page in 1..=pages_sampled as u32 {
        total_chars += source.page_text(page)?.trim().chars().count();
        total_area += source.page_size(page)?.area();
    }

    let text_density = if total_area > 0.0 {
        total_chars as f64 / total_area
    } else {
        0.0
    };

    let image_based =
        text_density < config.min_text_density || total_chars < config.min_sample_chars;

    tracing::debug!(
        pages_sampled,
        total_chars,
        text_density,
        image_based,
        "classified document"
    );

    Ok(Classification {
        kind: if image_based {
            DocumentKind::ImageBased
        } else {
            DocumentKind::TextBased
        },
        text_density,
        total_chars,
        pages_sampled,
        confidence: if image_based {
            Confidence::High
        } else {
            Confidence::Low
        },
    })
}
