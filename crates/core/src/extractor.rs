use crate::classifier::{classify_document, Classification};
use crate::config::ExtractionConfig;
use crate::error::IngestError;
use crate::render::encode_page_image;
use crate::traits::{OcrService, PageRenderer, PageSource};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMode {
    /// Text layer only.
    Direct,
    /// Classify first and OCR thin pages of scanned documents.
    Smart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrStage {
    Rendering,
    Ocr,
}

/// Progress reported while a document is extracted, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionEvent {
    Detecting {
        message: String,
    },
    Extract {
        current: usize,
        total: usize,
        message: String,
    },
    OcrStart {
        total: usize,
        message: String,
    },
    Ocr {
        stage: OcrStage,
        page: u32,
        current: usize,
        total: usize,
        message: String,
    },
    Complete {
        stats: ExtractionStats,
        message: String,
    },
}

impl ExtractionEvent {
    pub fn message(&self) -> &str {
        match self {
            ExtractionEvent::Detecting { message }
            | ExtractionEvent::Extract { message, .. }
            | ExtractionEvent::OcrStart { message, .. }
            | ExtractionEvent::Ocr { message, .. }
            | ExtractionEvent::Complete { message, .. } => message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRecord {
    pub page_number: u32,
    pub text: String,
    #[serde(rename = "needsOCR")]
    pub needs_ocr: bool,
    #[serde(rename = "ocrApplied")]
    pub ocr_applied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionStats {
    pub total_pages: usize,
    pub text_layer_pages: usize,
    pub ocr_pages: usize,
}

#[derive(Debug, Clone)]
pub struct ExtractionOutput {
    pub pages: Vec<PageRecord>,
    pub stats: ExtractionStats,
    pub full_text: String,
    /// Present when the smart path ran the classifier.
    pub classification: Option<Classification>,
}

impl ExtractionOutput {
    fn assemble(pages: Vec<PageRecord>, classification: Option<Classification>) -> Self {
        let ocr_pages = pages.iter().filter(|page| page.ocr_applied).count();
        let stats = ExtractionStats {
            total_pages: pages.len(),
            text_layer_pages: pages.len() - ocr_pages,
            ocr_pages,
        };
        let full_text = pages
            .iter()
            .map(|page| page.text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        Self {
            pages,
            stats,
            full_text,
            classification,
        }
    }

    pub fn ocr_applied(&self) -> bool {
        self.stats.ocr_pages > 0
    }
}

/// Reads the text layer of every page in order.
pub fn extract_direct(
    source: &dyn PageSource,
    on_progress: &mut dyn FnMut(ExtractionEvent),
) -> Result<ExtractionOutput, IngestError> {
    let pages = read_text_layer(source, 0, on_progress)?;
    let output = ExtractionOutput::assemble(pages, None);
    complete(&output, on_progress);
    Ok(output)
}

/// Classifies the document and OCRs pages with a thin text layer when the
/// document looks scanned and an OCR service is available. Falls back to the
/// text layer otherwise.
pub async fn extract_smart(
    source: &dyn PageSource,
    renderer: &dyn PageRenderer,
    ocr: Option<&dyn OcrService>,
    config: &ExtractionConfig,
    on_progress: &mut dyn FnMut(ExtractionEvent),
) -> Result<ExtractionOutput, IngestError> {
    on_progress(ExtractionEvent::Detecting {
        message: "Analyzing document type...".to_string(),
    });
    let classification = classify_document(source, config)?;

    let ocr = match (classification.is_image_based(), ocr) {
        (true, Some(ocr)) => ocr,
        (true, None) => {
            tracing::warn!("document looks scanned but no OCR credential is set; using text layer");
            return direct_with(source, classification, on_progress);
        }
        (false, _) => return direct_with(source, classification, on_progress),
    };

    let mut pages = read_text_layer(source, config.ocr_threshold, on_progress)?;
    let marked = pages
        .iter()
        .enumerate()
        .filter(|(_, page)| page.needs_ocr)
        .map(|(index, _)| index)
        .collect::<Vec<_>>();

    if let Some(limit) = config.max_ocr_pages {
        if marked.len() > limit {
            return Err(IngestError::TooManyOcrPages {
                pages: marked.len(),
                limit,
            });
        }
    }

    let total = marked.len();
    on_progress(ExtractionEvent::OcrStart {
        total,
        message: format!("{total} page(s) need OCR"),
    });

    let mut called = false;
    for (position, index) in marked.into_iter().enumerate() {
        let page = pages[index].page_number;
        let current = position + 1;

        on_progress(ExtractionEvent::Ocr {
            stage: OcrStage::Rendering,
            page,
            current,
            total,
            message: format!("Rendering page {page} ({current}/{total})"),
        });
        let image = renderer.render_page(page, config.render_scale)?;
        let encoded = encode_page_image(&image, page, config.render_scale, config)?;

        if called {
            tokio::time::sleep(config.ocr_delay).await;
        }
        on_progress(ExtractionEvent::Ocr {
            stage: OcrStage::Ocr,
            page,
            current,
            total,
            message: format!("Running OCR on page {page} ({current}/{total})"),
        });
        let text = ocr
            .recognize(&encoded, page)
            .await
            .map_err(|source| IngestError::OcrFailed { page, source })?;
        called = true;

        tracing::debug!(page, chars = text.len(), "page recognized");
        pages[index].text = text;
        pages[index].ocr_applied = true;
    }

    let output = ExtractionOutput::assemble(pages, Some(classification));
    complete(&output, on_progress);
    Ok(output)
}

fn direct_with(
    source: &dyn PageSource,
    classification: Classification,
    on_progress: &mut dyn FnMut(ExtractionEvent),
) -> Result<ExtractionOutput, IngestError> {
    let mut output = extract_direct(source, on_progress)?;
    output.classification = Some(classification);
    Ok(output)
}

/// Text layer for every page; pages shorter than `ocr_threshold` are marked.
fn read_text_layer(
    source: &dyn PageSource,
    ocr_threshold: usize,
    on_progress: &mut dyn FnMut(ExtractionEvent),
) -> Result<Vec<PageRecord>, IngestError> {
    let total = source.page_count();
    if total == 0 {
        return Err(IngestError::EmptyDocument);
    }

    let mut pages = Vec::with_capacity(total);
    for page_number in 1..=total as u32 {
        on_progress(ExtractionEvent::Extract {
            current: page_number as usize,
            total,
            message: format!("Extracting text from page {page_number}/{total}"),
        });

        let text = match source.page_text(page_number) {
            Ok(text) => text,
            Err(error @ IngestError::PageOutOfRange { .. }) => return Err(error),
            Err(error) => {
                tracing::warn!(page = page_number, %error, "unreadable text layer");
                String::new()
            }
        };
        let needs_ocr = text.trim().chars().count() < ocr_threshold;
        pages.push(PageRecord {
            page_number,
            text,
            needs_ocr,
            ocr_applied: false,
        });
    }

    Ok(pages)
}

fn complete(output: &ExtractionOutput, on_progress: &mut dyn FnMut(ExtractionEvent)) {
    let stats = output.stats;
    tracing::info!(
        total_pages = stats.total_pages,
        text_layer_pages = stats.text_layer_pages,
        ocr_pages = stats.ocr_pages,
        "extraction complete"
    );
    on_progress(ExtractionEvent::Complete {
        stats,
        message: format!(
            "Extracted {} page(s): {} from text layer, {} via OCR",
            stats.total_pages, stats.text_layer_pages, stats.ocr_pages
        ),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::tests::FakePages;
    use crate::error::ProviderError;
    use crate::models::PageImage;
    use async_trait::async_trait;
    use image::{DynamicImage, RgbImage};
    use std::sync::Mutex;

    struct BlankRenderer {
        blank_pages: Vec<u32>,
    }

    impl PageRenderer for BlankRenderer {
        fn render_page(&self, page: u32, _scale: f32) -> Result<DynamicImage, IngestError> {
            if self.blank_pages.contains(&page) {
                return Err(IngestError::NothingToRender(page));
            }
            Ok(DynamicImage::ImageRgb8(RgbImage::new(32, 32)))
        }
    }

    struct EchoOcr {
        calls: Mutex<Vec<u32>>,
        fail_on: Option<u32>,
    }

    impl EchoOcr {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_on: None,
            }
        }

        fn calls(&self) -> Vec<u32> {
            self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl OcrService for EchoOcr {
        async fn recognize(&self, image: &PageImage, page_hint: u32) -> Result<String, ProviderError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(page_hint);
            }
            if self.fail_on == Some(page_hint) {
                return Err(ProviderError::RateLimited {
                    provider: "echo".to_string(),
                    details: "quota".to_string(),
                });
            }
            assert_eq!(image.page_number, page_hint);
            Ok(format!("recognized page {page_hint}"))
        }
    }

    fn renderer() -> BlankRenderer {
        BlankRenderer {
            blank_pages: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scanned_document_is_fully_ocrd() -> Result<(), IngestError> {
        let source = FakePages::uniform(10, 12);
        let ocr = EchoOcr::new();
        let mut events = Vec::new();

        let output = extract_smart(
            &source,
            &renderer(),
            Some(&ocr),
            &ExtractionConfig::default(),
            &mut |event| events.push(event),
        )
        .await?;

        assert_eq!(output.stats.ocr_pages, 10);
        assert_eq!(output.stats.text_layer_pages, 0);
        assert!(output.pages.iter().all(|page| page.needs_ocr && page.ocr_applied));
        assert_eq!(ocr.calls(), (1..=10).collect::<Vec<_>>());
        assert!(output.full_text.starts_with("recognized page 1\n\nrecognized page 2"));
        assert!(matches!(events.first(), Some(ExtractionEvent::Detecting { .. })));
        assert!(matches!(events.last(), Some(ExtractionEvent::Complete { .. })));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn ocr_calls_are_spaced_by_the_configured_delay() -> Result<(), IngestError> {
        let source = FakePages::uniform(3, 0);
        let ocr = EchoOcr::new();
        let started = tokio::time::Instant::now();

        extract_smart(
            &source,
            &renderer(),
            Some(&ocr),
            &ExtractionConfig::default(),
            &mut |_| {},
        )
        .await?;

        assert_eq!(started.elapsed(), std::time::Duration::from_millis(4_000));
        Ok(())
    }

    #[tokio::test]
    async fn text_document_uses_text_layer() -> Result<(), IngestError> {
        let source = FakePages::uniform(3, 1_000);
        let ocr = EchoOcr::new();

        let output = extract_smart(
            &source,
            &renderer(),
            Some(&ocr),
            &ExtractionConfig::default(),
            &mut |_| {},
        )
        .await?;

        assert_eq!(output.stats.text_layer_pages, 3);
        assert_eq!(output.stats.ocr_pages, 0);
        assert!(output.pages.iter().all(|page| !page.needs_ocr && !page.ocr_applied));
        assert!(ocr.calls().is_empty());
        assert!(output.classification.is_some_and(|c| !c.is_image_based()));
        Ok(())
    }

    #[tokio::test]
    async fn scanned_document_without_ocr_falls_back_to_direct() -> Result<(), IngestError> {
        let source = FakePages::uniform(4, 10);

        let output = extract_smart(
            &source,
            &renderer(),
            None,
            &ExtractionConfig::default(),
            &mut |_| {},
        )
        .await?;

        assert_eq!(output.stats.text_layer_pages, 4);
        assert!(!output.ocr_applied());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn hybrid_keeps_dense_pages_and_merges_in_order() -> Result<(), IngestError> {
        let source = FakePages {
            pages: vec!["x".repeat(150), String::new(), String::new(), "y".repeat(40)],
        };
        let ocr = EchoOcr::new();

        let output = extract_smart(
            &source,
            &renderer(),
            Some(&ocr),
            &ExtractionConfig::default(),
            &mut |_| {},
        )
        .await?;

        assert_eq!(ocr.calls(), vec![2, 3, 4]);
        assert_eq!(output.pages[0].text, "x".repeat(150));
        assert!(!output.pages[0].needs_ocr);
        assert_eq!(output.pages[3].text, "recognized page 4");
        assert_eq!(output.stats.ocr_pages, 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn ocr_failure_surfaces_with_page() {
        let source = FakePages::uniform(3, 0);
        let mut ocr = EchoOcr::new();
        ocr.fail_on = Some(2);

        let result = extract_smart(
            &source,
            &renderer(),
            Some(&ocr),
            &ExtractionConfig::default(),
            &mut |_| {},
        )
        .await;

        assert!(matches!(result, Err(IngestError::OcrFailed { page: 2, .. })));
    }

    #[tokio::test]
    async fn page_ceiling_is_checked_before_any_ocr() {
        let source = FakePages::uniform(6, 0);
        let ocr = EchoOcr::new();
        let config = ExtractionConfig {
            max_ocr_pages: Some(5),
            ..ExtractionConfig::default()
        };

        let result = extract_smart(&source, &renderer(), Some(&ocr), &config, &mut |_| {}).await;

        assert!(matches!(
            result,
            Err(IngestError::TooManyOcrPages { pages: 6, limit: 5 })
        ));
        assert!(ocr.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unrenderable_scanned_page_fails_extraction() {
        let source = FakePages::uniform(2, 5);
        let ocr = EchoOcr::new();
        let renderer = BlankRenderer {
            blank_pages: vec![2],
        };

        let result = extract_smart(
            &source,
            &renderer,
            Some(&ocr),
            &ExtractionConfig::default(),
            &mut |_| {},
        )
        .await;

        assert!(matches!(result, Err(IngestError::NothingToRender(2))));
        assert_eq!(ocr.calls(), vec![1]);
    }

    #[test]
    fn direct_mode_joins_non_empty_pages() -> Result<(), IngestError> {
        let source = FakePages {
            pages: vec!["first".to_string(), "  ".to_string(), "third".to_string()],
        };

        let output = extract_direct(&source, &mut |_| {})?;

        assert_eq!(output.full_text, "first\n\nthird");
        assert_eq!(output.stats.total_pages, 3);
        Ok(())
    }

    #[test]
    fn direct_mode_never_marks_pages_for_ocr() -> Result<(), IngestError> {
        let source = FakePages {
            pages: vec!["x".repeat(1_000), String::new(), "short".to_string()],
        };

        let output = extract_direct(&source, &mut |_| {})?;

        assert!(output.pages.iter().all(|page| !page.needs_ocr && !page.ocr_applied));
        assert_eq!(output.stats.text_layer_pages, 3);
        Ok(())
    }

    #[test]
    fn direct_mode_rejects_empty_document() {
        let source = FakePages { pages: Vec::new() };
        assert!(matches!(
            extract_direct(&source, &mut |_| {}),
            Err(IngestError::EmptyDocument)
        ));
    }
}
