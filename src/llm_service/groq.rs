use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use futures::StreamExt;
use log::debug;

use super::{LlmClient, LlmError, TextStream};
use crate::config::LlmSettings;
use crate::types::{ChatRole, ChatTurn};

/// Groq's OpenAI-compatible chat completions endpoint.
pub struct GroqClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl GroqClient {
    pub fn new(settings: &LlmSettings) -> Result<Self, LlmError> {
        let api_key = settings
            .groq_api_key
            .as_deref()
            .ok_or_else(|| LlmError::Misconfigured("GROQ_API_KEY is not set".to_string()))?;

        let config = OpenAIConfig::new()
            .with_api_base(settings.groq_api_base.trim_end_matches('/'))
            .with_api_key(api_key);

        Ok(Self {
            client: Client::with_config(config),
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        })
    }

    fn request(&self, messages: &[ChatTurn], stream: bool) -> Result<CreateChatCompletionRequest, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(request_messages(messages)?)
            .temperature(self.temperature)
            .max_completion_tokens(self.max_tokens)
            .stream(stream)
            .build()?;
        Ok(request)
    }
}

pub(crate) fn request_messages(
    messages: &[ChatTurn],
) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
    messages
        .iter()
        .map(|turn| {
            let message: ChatCompletionRequestMessage = match turn.role {
                ChatRole::System => ChatCompletionRequestSystemMessageArgs::default()
                    .content(turn.content.as_str())
                    .build()?
                    .into(),
                ChatRole::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(turn.content.as_str())
                    .build()?
                    .into(),
                ChatRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(turn.content.as_str())
                    .build()?
                    .into(),
            };
            Ok(message)
        })
        .collect()
}

#[async_trait]
impl LlmClient for GroqClient {
    fn name(&self) -> &'static str {
        "groq"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, messages: &[ChatTurn]) -> Result<String, LlmError> {
        let request = self.request(messages, false)?;
        debug!("Sending {} messages to Groq", messages.len());

        let response = self.client.chat().create(request).await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::MalformedResponse("completion had no message content".to_string()))
    }

    async fn generate_stream(&self, messages: &[ChatTurn]) -> Result<TextStream, LlmError> {
        let request = self.request(messages, true)?;
        let stream = self.client.chat().create_stream(request).await?;

        let fragments = stream.filter_map(|result| async move {
            match result {
                Ok(response) => {
                    let text: String = response
                        .choices
                        .into_iter()
                        .filter_map(|choice| choice.delta.content)
                        .collect();
                    if text.is_empty() {
                        None
                    } else {
                        Some(Ok(text))
                    }
                }
                Err(e) => Some(Err(LlmError::from(e))),
            }
        });

        Ok(fragments.boxed())
    }
}
