use crate::config::RetrievalConfig;
use crate::embeddings::EmbeddingClient;
use crate::error::ChatError;
use crate::llm::ChatClient;
use crate::models::{ChatMessage, ScoredChunk};
use crate::store::KnowledgeStore;
use crate::traits::{CompletionOptions, PromptMessage};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

pub const NO_RELEVANT_INFORMATION: &str = "I couldn't find relevant information in your documents \
to answer that. Try rephrasing the question or selecting different categories.";

pub const EMPTY_KNOWLEDGE_BASE: &str = "Your knowledge base is empty. Upload a PDF first, then \
ask questions about it.";

const INTENT_SYSTEM_PROMPT: &str = "Decide whether the user's latest message needs a search of \
their uploaded documents or is casual conversation (greetings, thanks, questions about you). \
When it needs a search, rewrite it as a standalone search query, resolving references to earlier \
turns. Respond with JSON only, no prose: {\"type\": \"search\" | \"chat\", \"newQuery\": string}";

const ANSWER_SYSTEM_PROMPT: &str = "You answer questions about the user's documents. Use only the \
supplied context. If the context does not contain the answer, say so explicitly instead of \
guessing. Format the answer in markdown and render tabular data as markdown tables.";

const CHAT_SYSTEM_PROMPT: &str = "You are a friendly assistant for a document question-answering \
app. Reply briefly in markdown. For questions about documents, invite the user to ask about \
their uploaded files.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    Search,
    Chat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    #[serde(rename = "type")]
    pub kind: IntentKind,
    #[serde(rename = "newQuery", default)]
    pub new_query: String,
}

impl Intent {
    fn search(query: &str) -> Self {
        Self {
            kind: IntentKind::Search,
            new_query: query.to_string(),
        }
    }
}

/// Reads the classifier's JSON reply, tolerating code fences and prose
/// around the object. Anything unreadable falls back to searching for
/// `original`.
pub fn parse_intent(raw: &str, original: &str) -> Intent {
    let object = match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => {
            tracing::debug!("intent reply has no JSON object; defaulting to search");
            return Intent::search(original);
        }
    };

    match serde_json::from_str::<Intent>(object) {
        Ok(mut intent) => {
            if intent.new_query.trim().is_empty() {
                intent.new_query = original.to_string();
            }
            intent
        }
        Err(error) => {
            tracing::debug!(%error, "unreadable intent reply; defaulting to search");
            Intent::search(original)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TurnOutcome {
    Answered,
    Conversational,
    /// Retrieval ran but nothing cleared the threshold. `None` when the
    /// filtered chunk set was empty.
    NoRelevantInformation { best_similarity: Option<f32> },
    EmptyKnowledgeBase,
}

#[derive(Debug, Clone)]
pub struct TurnResult {
    pub answer: String,
    pub intent: Intent,
    pub outcome: TurnOutcome,
    pub sources: Vec<ScoredChunk>,
}

struct ProcessingGuard<'a>(&'a AtomicBool);

impl<'a> ProcessingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs one conversational turn: intent, optional retrieval, answer, and
/// persistence of both sides of the exchange.
pub struct RetrievalOrchestrator<'a> {
    store: &'a KnowledgeStore,
    embeddings: &'a EmbeddingClient,
    chat: &'a ChatClient,
    config: RetrievalConfig,
    processing: AtomicBool,
}

impl<'a> RetrievalOrchestrator<'a> {
    pub fn new(
        store: &'a KnowledgeStore,
        embeddings: &'a EmbeddingClient,
        chat: &'a ChatClient,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embeddings,
            chat,
            config,
            processing: AtomicBool::new(false),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// `categories` restricts retrieval to documents in those categories;
    /// empty means the whole knowledge base.
    pub async fn handle_turn(
        &self,
        query: &str,
        categories: &[String],
    ) -> Result<TurnResult, ChatError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ChatError::EmptyQuery);
        }
        let _guard = ProcessingGuard::acquire(&self.processing).ok_or(ChatError::Busy)?;

        let window = self.config.intent_history.max(self.config.answer_history);
        let history = self.store.recent_history(window);
        self.store.append_message(ChatMessage::user(query))?;

        match self.respond(query, categories, &history).await {
            Ok(result) => {
                self.store
                    .append_message(ChatMessage::assistant(result.answer.clone()))?;
                Ok(result)
            }
            Err(error) => {
                tracing::warn!(%error, "turn failed");
                let notice = ChatMessage::assistant(format!("Sorry, something went wrong: {error}"));
                if let Err(store_error) = self.store.append_message(notice) {
                    tracing::warn!(error = %store_error, "could not record failure message");
                }
                Err(error)
            }
        }
    }

    async fn respond(
        &self,
        query: &str,
        categories: &[String],
        history: &[ChatMessage],
    ) -> Result<TurnResult, ChatError> {
        let intent = self
            .classify_intent(query, tail(history, self.config.intent_history))
            .await;
        tracing::info!(intent = ?intent.kind, new_query = %intent.new_query, "classified turn");

        let answer_history = tail(history, self.config.answer_history);
        if intent.kind == IntentKind::Chat {
            let answer = self.converse(query, answer_history).await?;
            return Ok(TurnResult {
                answer,
                intent,
                outcome: TurnOutcome::Conversational,
                sources: Vec::new(),
            });
        }

        if self.store.chunk_count() == 0 {
            return Ok(TurnResult {
                answer: EMPTY_KNOWLEDGE_BASE.to_string(),
                intent,
                outcome: TurnOutcome::EmptyKnowledgeBase,
                sources: Vec::new(),
            });
        }

        let filter = (!categories.is_empty())
            .then(|| self.store.document_ids_for_categories(categories));
        let query_vector = self.embeddings.embed(&intent.new_query).await?;
        let hits = self
            .store
            .search(&query_vector, filter.as_deref(), self.config.top_k);

        let best_similarity = hits.first().map(|hit| hit.similarity);
        let relevant = best_similarity
            .is_some_and(|similarity| similarity >= self.config.similarity_threshold);
        tracing::debug!(
            hits = hits.len(),
            similarity = best_similarity.unwrap_or_default(),
            threshold = self.config.similarity_threshold,
            "retrieval finished"
        );

        if !relevant {
            return Ok(TurnResult {
                answer: NO_RELEVANT_INFORMATION.to_string(),
                intent,
                outcome: TurnOutcome::NoRelevantInformation { best_similarity },
                sources: hits,
            });
        }

        let answer = self.answer(query, &hits, answer_history).await?;
        Ok(TurnResult {
            answer,
            intent,
            outcome: TurnOutcome::Answered,
            sources: hits,
        })
    }

    async fn classify_intent(&self, query: &str, history: &[ChatMessage]) -> Intent {
        let transcript = history
            .iter()
            .map(|message| format!("{}: {}", message.role.as_str(), message.content))
            .collect::<Vec<_>>()
            .join("\n");
        let messages = [
            PromptMessage::system(INTENT_SYSTEM_PROMPT),
            PromptMessage::user(format!(
                "Conversation so far:\n{transcript}\n\nLatest message: {query}"
            )),
        ];
        let options = CompletionOptions {
            temperature: 0.0,
            max_tokens: 256,
            top_p: 1.0,
        };

        match self.chat.complete(&messages, Some(options)).await {
            Ok(reply) => parse_intent(&reply, query),
            Err(error) => {
                tracing::warn!(%error, "intent classification failed; defaulting to search");
                Intent::search(query)
            }
        }
    }

    async fn answer(
        &self,
        query: &str,
        hits: &[ScoredChunk],
        history: &[ChatMessage],
    ) -> Result<String, ChatError> {
        let context = hits
            .iter()
            .enumerate()
            .map(|(index, hit)| {
                format!(
                    "[{}] {}\n{}",
                    index + 1,
                    hit.chunk.metadata.file_name,
                    hit.chunk.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");

        let mut messages = vec![PromptMessage::system(ANSWER_SYSTEM_PROMPT)];
        messages.extend(history.iter().map(PromptMessage::from));
        messages.push(PromptMessage::user(format!(
            "Context:\n\n{context}\n\nQuestion: {query}"
        )));

        Ok(self.chat.complete(&messages, None).await?)
    }

    async fn converse(&self, query: &str, history: &[ChatMessage]) -> Result<String, ChatError> {
        let mut messages = vec![PromptMessage::system(CHAT_SYSTEM_PROMPT)];
        messages.extend(history.iter().map(PromptMessage::from));
        messages.push(PromptMessage::user(query));
        Ok(self.chat.complete(&messages, None).await?)
    }
}

fn tail<T>(items: &[T], count: usize) -> &[T] {
    &items[items.len().saturating_sub(count)..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::error::ProviderError;
    use crate::llm::tests::{quick_config, ScriptedChat};
    use crate::models::Role;
    use crate::store::tests::{drafts, new_document};
    use crate::traits::EmbeddingService;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    /// Every text embeds to the unit x-axis.
    struct AxisEmbedding;

    #[async_trait]
    impl EmbeddingService for AxisEmbedding {
        fn provider(&self) -> &str {
            "axis"
        }

        async fn embed(&self, _text: &str, _dimension: usize) -> Result<Vec<f32>, ProviderError> {
            Ok(vec![1.0, 0.0])
        }
    }

    fn embeddings() -> EmbeddingClient {
        let config = EmbeddingConfig {
            dimension: 2,
            min_delay: Duration::ZERO,
            ..EmbeddingConfig::default()
        };
        EmbeddingClient::new(&config).with_service(Arc::new(AxisEmbedding))
    }

    /// A chunk whose cosine similarity to the x-axis is exactly `similarity`.
    fn store_with_similarity(similarity: f32, category: &str) -> KnowledgeStore {
        let store = KnowledgeStore::in_memory();
        let embedding = [similarity, (1.0 - similarity * similarity).sqrt()];
        let added = store.add_document(
            new_document("manual.pdf", Some(category)),
            drafts(&["The pump must be primed before first use."], &embedding),
        );
        assert!(added.is_ok());
        store
    }

    fn search_reply() -> Result<String, ProviderError> {
        Ok(r#"{"type": "search", "newQuery": "pump priming"}"#.to_string())
    }

    #[test]
    fn intent_parsing_tolerates_fences_and_falls_back() {
        let fenced = "```json\n{\"type\": \"chat\", \"newQuery\": \"hi\"}\n```";
        assert_eq!(parse_intent(fenced, "hi").kind, IntentKind::Chat);

        let fallback = parse_intent("I think this is a search", "what is x?");
        assert_eq!(fallback, Intent::search("what is x?"));

        let unknown = parse_intent(r#"{"type": "lookup"}"#, "q");
        assert_eq!(unknown, Intent::search("q"));

        let blank = parse_intent(r#"{"type": "search", "newQuery": "  "}"#, "original");
        assert_eq!(blank.new_query, "original");
    }

    #[tokio::test]
    async fn below_threshold_skips_generation() -> Result<(), ChatError> {
        let store = store_with_similarity(0.20, "Manuals");
        let embeddings = embeddings();
        let service = Arc::new(ScriptedChat::new(vec![search_reply()]));
        let chat = ChatClient::new(&quick_config()).with_service(service.clone());
        let orchestrator =
            RetrievalOrchestrator::new(&store, &embeddings, &chat, RetrievalConfig::default());

        let result = orchestrator.handle_turn("How do I prime the pump?", &[]).await?;

        assert_eq!(result.answer, NO_RELEVANT_INFORMATION);
        match result.outcome {
            TurnOutcome::NoRelevantInformation {
                best_similarity: Some(similarity),
            } => assert!((similarity - 0.20).abs() < 1e-4),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(service.request_count(), 1);
        assert_eq!(store.history().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn relevant_hit_is_answered_from_context() -> Result<(), ChatError> {
        let store = store_with_similarity(0.8, "Manuals");
        store.append_message(ChatMessage::user("earlier"))?;
        let embeddings = embeddings();
        let service = Arc::new(ScriptedChat::new(vec![
            search_reply(),
            Ok("Prime it first.".to_string()),
        ]));
        let chat = ChatClient::new(&quick_config()).with_service(service.clone());
        let orchestrator =
            RetrievalOrchestrator::new(&store, &embeddings, &chat, RetrievalConfig::default());

        let result = orchestrator.handle_turn("How do I prime the pump?", &[]).await?;

        assert_eq!(result.answer, "Prime it first.");
        assert_eq!(result.outcome, TurnOutcome::Answered);
        assert_eq!(result.sources.len(), 1);

        let requests = service.requests.lock().map(|r| r.clone()).unwrap_or_default();
        let prompt = requests[1].1.last().map(PromptMessage::text_content).unwrap_or_default();
        assert!(prompt.contains("The pump must be primed"));
        assert!(prompt.ends_with("Question: How do I prime the pump?"));
        assert_eq!(requests[1].1[1].text_content(), "earlier");

        let history = store.history();
        assert_eq!(history.last().map(|m| m.role), Some(Role::Assistant));
        assert_eq!(history.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn empty_knowledge_base_is_distinguished() -> Result<(), ChatError> {
        let store = KnowledgeStore::in_memory();
        let embeddings = embeddings();
        let service = Arc::new(ScriptedChat::new(vec![search_reply()]));
        let chat = ChatClient::new(&quick_config()).with_service(service.clone());
        let orchestrator =
            RetrievalOrchestrator::new(&store, &embeddings, &chat, RetrievalConfig::default());

        let result = orchestrator.handle_turn("anything", &[]).await?;

        assert_eq!(result.outcome, TurnOutcome::EmptyKnowledgeBase);
        assert_eq!(result.answer, EMPTY_KNOWLEDGE_BASE);
        assert_eq!(service.request_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn category_filter_excludes_other_documents() -> Result<(), ChatError> {
        let store = store_with_similarity(0.9, "Manuals");
        let embeddings = embeddings();
        let service = Arc::new(ScriptedChat::new(vec![search_reply()]));
        let chat = ChatClient::new(&quick_config()).with_service(service.clone());
        let orchestrator =
            RetrievalOrchestrator::new(&store, &embeddings, &chat, RetrievalConfig::default());

        let result = orchestrator
            .handle_turn("How do I prime the pump?", &["Invoices".to_string()])
            .await?;

        assert_eq!(
            result.outcome,
            TurnOutcome::NoRelevantInformation {
                best_similarity: None
            }
        );
        assert_eq!(service.request_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failed_intent_call_still_searches() -> Result<(), ChatError> {
        let store = store_with_similarity(0.9, "Manuals");
        let embeddings = embeddings();
        let service = Arc::new(ScriptedChat::new(vec![
            Err(ProviderError::Api {
                provider: "scripted".to_string(),
                status: 500,
                details: "boom".to_string(),
            }),
            Ok("answer".to_string()),
        ]));
        let chat = ChatClient::new(&quick_config()).with_service(service.clone());
        let orchestrator =
            RetrievalOrchestrator::new(&store, &embeddings, &chat, RetrievalConfig::default());

        let result = orchestrator.handle_turn("prime?", &[]).await?;

        assert_eq!(result.intent, Intent::search("prime?"));
        assert_eq!(result.outcome, TurnOutcome::Answered);
        Ok(())
    }

    #[tokio::test]
    async fn chat_intent_skips_retrieval() -> Result<(), ChatError> {
        let store = KnowledgeStore::in_memory();
        let embeddings = EmbeddingClient::new(&EmbeddingConfig::default());
        let service = Arc::new(ScriptedChat::new(vec![
            Ok(r#"{"type": "chat", "newQuery": "hello"}"#.to_string()),
            Ok("Hi there!".to_string()),
        ]));
        let chat = ChatClient::new(&quick_config()).with_service(service.clone());
        let orchestrator =
            RetrievalOrchestrator::new(&store, &embeddings, &chat, RetrievalConfig::default());

        let result = orchestrator.handle_turn("hello", &[]).await?;

        assert_eq!(result.outcome, TurnOutcome::Conversational);
        assert_eq!(result.answer, "Hi there!");
        Ok(())
    }

    #[tokio::test]
    async fn generation_failure_is_recorded_and_clears_processing() {
        let store = store_with_similarity(0.9, "Manuals");
        let embeddings = embeddings();
        let service = Arc::new(ScriptedChat::new(vec![
            search_reply(),
            Err(ProviderError::Timeout {
                provider: "scripted".to_string(),
                after: Duration::from_secs(60),
            }),
        ]));
        let chat = ChatClient::new(&quick_config()).with_service(service.clone());
        let orchestrator =
            RetrievalOrchestrator::new(&store, &embeddings, &chat, RetrievalConfig::default());

        let result = orchestrator.handle_turn("prime?", &[]).await;

        assert!(matches!(result, Err(ChatError::Provider(ProviderError::Timeout { .. }))));
        assert!(!orchestrator.is_processing());
        let history = store.history();
        assert_eq!(history.len(), 2);
        assert!(history[1].content.starts_with("Sorry, something went wrong"));
    }

    #[tokio::test]
    async fn blank_query_is_rejected_without_side_effects() {
        let store = KnowledgeStore::in_memory();
        let embeddings = embeddings();
        let chat = ChatClient::new(&quick_config());
        let orchestrator =
            RetrievalOrchestrator::new(&store, &embeddings, &chat, RetrievalConfig::default());

        assert!(matches!(
            orchestrator.handle_turn("   ", &[]).await,
            Err(ChatError::EmptyQuery)
        ));
        assert!(store.history().is_empty());
    }
}
