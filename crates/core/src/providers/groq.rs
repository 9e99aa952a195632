use super::{classify_failure, transport_error};
use crate::config::ChatConfig;
use crate::error::ProviderError;
use crate::traits::{ChatService, CompletionOptions, ContentPart, PromptMessage};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;
use zeroize::Zeroizing;

const PROVIDER: &str = "groq";

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// OpenAI-compatible chat completions client used for chat, vision and OCR.
pub struct GroqChatService {
    client: Client,
    endpoint: Url,
    api_key: Zeroizing<String>,
    timeout: Duration,
}

impl GroqChatService {
    pub fn new(config: &ChatConfig, api_key: Zeroizing<String>) -> Result<Self, ProviderError> {
        Ok(Self {
            client: Client::new(),
            endpoint: Url::parse(&config.endpoint)?,
            api_key,
            timeout: config.vision_timeout.max(config.chat_timeout),
        })
    }
}

#[async_trait]
impl ChatService for GroqChatService {
    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn complete(
        &self,
        model: &str,
        messages: &[PromptMessage],
        options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        let url = self.endpoint.join("chat/completions")?;
        let body = completion_body(model, messages, options);

        let response = self
            .client
            .post(url)
            .bearer_auth(self.api_key.as_str())
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|error| transport_error(PROVIDER, error, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(PROVIDER, status, body));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|error| transport_error(PROVIDER, error, self.timeout))?;
        Ok(first_choice_text(parsed))
    }
}

fn completion_body(model: &str, messages: &[PromptMessage], options: &CompletionOptions) -> Value {
    let messages = messages
        .iter()
        .map(|message| {
            let content = if message.has_images() {
                Value::Array(
                    message
                        .parts
                        .iter()
                        .map(|part| match part {
                            ContentPart::Text(text) => json!({"type": "text", "text": text}),
                            ContentPart::ImageUrl(url) => {
                                json!({"type": "image_url", "image_url": {"url": url}})
                            }
                        })
                        .collect(),
                )
            } else {
                Value::String(message.text_content())
            };
            json!({"role": message.role, "content": content})
        })
        .collect::<Vec<_>>();

    json!({
        "model": model,
        "messages": messages,
        "temperature": options.temperature,
        "max_tokens": options.max_tokens,
        "top_p": options.top_p,
    })
}

fn first_choice_text(response: CompletionResponse) -> String {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message)
        .and_then(|message| message.content)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PageImage;
    use crate::traits::PromptRole;

    #[test]
    fn text_messages_are_sent_as_plain_strings() {
        let body = completion_body(
            "llama",
            &[PromptMessage::system("rules"), PromptMessage::user("hi")],
            &CompletionOptions::default(),
        );

        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["max_tokens"], 2_048);
    }

    #[test]
    fn image_messages_are_sent_as_parts() {
        let image = PageImage {
            page_number: 1,
            data: "QUJD".to_string(),
            mime_type: "image/jpeg".to_string(),
            quality: 0.9,
            scale: 2.0,
        };
        let message = PromptMessage::with_images(PromptRole::User, "read this", &[image]);
        let body = completion_body("vision", &[message], &CompletionOptions::default());

        let parts = &body["messages"][0]["content"];
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/jpeg;base64,QUJD");
    }

    #[test]
    fn missing_content_yields_empty_string() -> Result<(), serde_json::Error> {
        let empty: CompletionResponse = serde_json::from_str(r#"{"choices":[{"message":{}}]}"#)?;
        assert_eq!(first_choice_text(empty), "");

        let none: CompletionResponse = serde_json::from_str("{}")?;
        assert_eq!(first_choice_text(none), "");

        let full: CompletionResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"answer"}}]}"#)?;
        assert_eq!(first_choice_text(full), "answer");
        Ok(())
    }
}
