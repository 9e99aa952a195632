use crate::config::VisionConfig;
use crate::error::VisionError;
use crate::llm::ChatClient;
use crate::models::{megabytes, ChatMessage, PageImage};
use crate::traits::{PromptMessage, PromptRole};
use serde::Serialize;

const DIRECT_SYSTEM_PROMPT: &str = "You analyze document page images. Answer the user's request \
using only what is visible on the pages. Use markdown, render tables as markdown tables and \
cite page numbers.";

const SYNTHESIS_SYSTEM_PROMPT: &str = "You are given analyses of consecutive batches of pages \
from one document. Integrate them into a single answer to the user's request. Merge tables that \
continue across pages into one markdown table, remove duplicated content, and cite page numbers \
for every fact.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisionEvent {
    Start { total_batches: usize },
    Batch {
        current: usize,
        total_batches: usize,
        pages: Vec<u32>,
    },
    Synthesize,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    /// 1-based.
    pub batch_index: usize,
    pub pages: Vec<u32>,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisionAnalysis {
    pub response: String,
    pub batch_results: Vec<BatchResult>,
}

fn total_bytes(images: &[PageImage]) -> usize {
    images.iter().map(PageImage::payload_bytes).sum()
}

fn page_list(images: &[PageImage]) -> Vec<u32> {
    images.iter().map(|image| image.page_number).collect()
}

fn join_pages(pages: &[u32]) -> String {
    pages
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Greedy packing under both ceilings. An image that alone exceeds the size
/// ceiling still gets a batch of its own.
pub fn partition_batches(
    images: Vec<PageImage>,
    max_bytes: usize,
    max_images: usize,
) -> Vec<Vec<PageImage>> {
    let max_images = max_images.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<PageImage> = Vec::new();
    let mut current_bytes = 0usize;

    for image in images {
        let size = image.payload_bytes();
        let over_size = current_bytes + size > max_bytes;
        let over_count = current.len() + 1 > max_images;

        if !current.is_empty() && (over_size || over_count) {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }

        current_bytes += size;
        current.push(image);
    }

    if !current.is_empty() {
        batches.push(current);
    }

    batches
}

pub struct VisionBatcher<'a> {
    chat: &'a ChatClient,
    config: VisionConfig,
}

impl<'a> VisionBatcher<'a> {
    pub fn new(chat: &'a ChatClient, config: VisionConfig) -> Self {
        Self { chat, config }
    }

    /// Whether a single request can carry `images`.
    pub fn fits_single_request(&self, images: &[PageImage]) -> bool {
        !images.is_empty()
            && images.len() <= self.config.max_images_per_batch
            && total_bytes(images) <= self.config.max_batch_bytes()
    }

    /// Routes to one direct call when the selection fits a single batch,
    /// otherwise to batched analysis.
    pub async fn analyze(
        &self,
        images: Vec<PageImage>,
        prompt: &str,
        history: &[ChatMessage],
        on_progress: &mut dyn FnMut(VisionEvent),
    ) -> Result<VisionAnalysis, VisionError> {
        if self.fits_single_request(&images) {
            let response = self.analyze_direct(&images, prompt, history).await?;
            return Ok(VisionAnalysis {
                response,
                batch_results: Vec::new(),
            });
        }
        self.batch_analyze(images, prompt, history, on_progress).await
    }

    /// One vision call for a small selection. Misuse is rejected before
    /// anything is sent.
    pub async fn analyze_direct(
        &self,
        images: &[PageImage],
        prompt: &str,
        history: &[ChatMessage],
    ) -> Result<String, VisionError> {
        self.validate_direct(images)?;

        let mut messages = vec![PromptMessage::system(DIRECT_SYSTEM_PROMPT)];
        messages.extend(history.iter().map(PromptMessage::from));
        messages.push(PromptMessage::with_images(
            PromptRole::User,
            format!("{prompt}\n\n(Pages: {})", join_pages(&page_list(images))),
            images,
        ));

        tracing::info!(pages = images.len(), bytes = total_bytes(images), "direct vision request");
        Ok(self.chat.complete_with_images(&messages, None).await?)
    }

    pub fn validate_direct(&self, images: &[PageImage]) -> Result<(), VisionError> {
        if images.is_empty() {
            return Err(VisionError::NoPages);
        }
        if images.len() > self.config.max_direct_pages {
            return Err(VisionError::TooManyPages {
                count: images.len(),
                limit: self.config.max_direct_pages,
            });
        }
        let bytes = total_bytes(images);
        if bytes > self.config.max_direct_bytes() {
            return Err(VisionError::PayloadTooLarge {
                actual_mb: megabytes(bytes),
                limit_mb: self.config.max_direct_mb,
            });
        }
        Ok(())
    }

    pub async fn batch_analyze(
        &self,
        images: Vec<PageImage>,
        prompt: &str,
        history: &[ChatMessage],
        on_progress: &mut dyn FnMut(VisionEvent),
    ) -> Result<VisionAnalysis, VisionError> {
        if images.is_empty() {
            return Err(VisionError::NoPages);
        }

        let batches = partition_batches(
            images,
            self.config.max_batch_bytes(),
            self.config.max_images_per_batch,
        );
        let total_batches = batches.len();
        on_progress(VisionEvent::Start { total_batches });

        let mut batch_results = Vec::with_capacity(total_batches);
        for (index, batch) in batches.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.batch_delay).await;
            }

            let batch_index = index + 1;
            let pages = page_list(batch);
            on_progress(VisionEvent::Batch {
                current: batch_index,
                total_batches,
                pages: pages.clone(),
            });

            let mut messages = vec![PromptMessage::system(batch_system_prompt(
                batch_index,
                total_batches,
                &pages,
            ))];
            messages.extend(history.iter().map(PromptMessage::from));
            messages.push(PromptMessage::with_images(PromptRole::User, prompt, batch));

            tracing::info!(
                batch = batch_index,
                total_batches,
                images = batch.len(),
                bytes = total_bytes(batch),
                "vision batch request"
            );
            let summary = self.chat.complete_with_images(&messages, None).await?;
            batch_results.push(BatchResult {
                batch_index,
                pages,
                summary,
            });
        }

        on_progress(VisionEvent::Synthesize);
        let response = self.synthesize(prompt, history, &batch_results).await?;
        on_progress(VisionEvent::Complete);

        Ok(VisionAnalysis {
            response,
            batch_results,
        })
    }

    async fn synthesize(
        &self,
        prompt: &str,
        history: &[ChatMessage],
        batch_results: &[BatchResult],
    ) -> Result<String, VisionError> {
        let context = synthesis_context(batch_results);
        let mut messages = vec![PromptMessage::system(SYNTHESIS_SYSTEM_PROMPT)];
        messages.extend(history.iter().map(PromptMessage::from));
        messages.push(PromptMessage::user(format!(
            "Request: {prompt}\n\nBatch analyses:\n\n{context}"
        )));

        tracing::info!(batches = batch_results.len(), "synthesizing vision batches");
        Ok(self.chat.complete(&messages, None).await?)
    }
}

fn batch_system_prompt(batch_index: usize, total_batches: usize, pages: &[u32]) -> String {
    format!(
        "You are analyzing batch {batch_index} of {total_batches} from a multi-page document. \
This batch contains pages {}. For each page, give a structured summary of its content: \
headings, key facts and figures, and any tables as markdown tables. Label every summary with \
its page number. Note tables that appear to continue from or onto another page.",
        join_pages(pages)
    )
}

/// Batch summaries in batch order, each labeled with its pages.
fn synthesis_context(batch_results: &[BatchResult]) -> String {
    batch_results
        .iter()
        .map(|result| {
            format!(
                "### Batch {} (pages {})\n{}",
                result.batch_index,
                join_pages(&result.pages),
                result.summary.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
