//! `query()`: プロンプト 1 つを投げて Reply を受け取るまで
//!
//! ファサード・オーケストレーターをつなぎ、どんな失敗もエラー応答の Reply に変える。
//! 呼び出し側に例外的な経路は返さない。

use crate::cancel::CancelSignal;
use crate::client::LlmClient;
use crate::config::{ModelConfig, OptionBag};
use crate::error::Error;
use crate::events::{emit, EventSink, LlmEvent};
use crate::factory::AnyProvider;
use crate::message::{ensure_user_message, prompt_text, Message};
use crate::metrics::as_millis_f64;
use crate::orchestrator::{OrchestratorSettings, RequestContext, ResponseOrchestrator, StreamFailure};
use crate::provider::LlmProvider;
use crate::reply::Reply;
use tracing::warn;

/// クライアントとオーケストレーターの組
pub struct QueryRunner<P: LlmProvider> {
    client: LlmClient<P>,
    orchestrator: ResponseOrchestrator,
    system_prompt: Option<String>,
}

impl QueryRunner<AnyProvider> {
    pub fn from_config(config: ModelConfig) -> Result<Self, Error> {
        Ok(Self::new(LlmClient::from_config(config)?))
    }
}

impl<P: LlmProvider> QueryRunner<P> {
    /// 設定の query_timeout をオーケストレーターに反映して組み立てる
    pub fn new(client: LlmClient<P>) -> Self {
        let settings = OrchestratorSettings {
            query_timeout: client.config().query_timeout(),
            ..Default::default()
        };
        Self {
            orchestrator: ResponseOrchestrator::new().with_settings(settings),
            client,
            system_prompt: None,
        }
    }

    pub fn with_orchestrator(mut self, orchestrator: ResponseOrchestrator) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        self.system_prompt = if prompt.trim().is_empty() { None } else { Some(prompt) };
        self
    }

    pub fn client(&self) -> &LlmClient<P> {
        &self.client
    }

    /// プロンプトを user メッセージ 1 つにして問い合わせる（stream は設定に従う）
    pub fn query(&self, user_prompt: &str, sink: &mut dyn EventSink, cancel: &dyn CancelSignal) -> Reply {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system_prompt {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(user_prompt));
        let stream = self.client.config().stream_enabled();
        self.query_messages(&messages, stream, &OptionBag::new(), sink, cancel)
    }

    /// メッセージ列で問い合わせる
    pub fn query_messages(
        &self,
        messages: &[Message],
        stream: bool,
        overrides: &OptionBag,
        sink: &mut dyn EventSink,
        cancel: &dyn CancelSignal,
    ) -> Reply {
        let model = self.client.config().name.clone();
        let ctx = RequestContext {
            model: model.clone(),
            prompt_text: prompt_text(messages),
            start: self.orchestrator.now(),
        };

        let outcome = ensure_user_message(messages)
            .and_then(|_| self.client.chat(messages, stream, overrides))
            .map_err(|error| StreamFailure {
                error,
                partial_metrics: Default::default(),
                partial_response: None,
            })
            .and_then(|response| {
                self.orchestrator
                    .process(self.client.provider(), response, &ctx, sink, cancel)
            });

        let reply = match outcome {
            Ok(reply) => reply,
            Err(failure) => {
                let latency = self.orchestrator.now().saturating_duration_since(ctx.start);
                let mut reply = Reply::from_error(&failure.error, &model, as_millis_f64(latency));
                if failure.partial_response.is_some() {
                    reply.partial_response = failure.partial_response.clone();
                }
                warn!(
                    model = %model,
                    kind = failure.error.kind().as_str(),
                    "query failed: {}",
                    failure.error
                );
                let partial_metrics = if failure.partial_metrics.is_empty() {
                    reply.performance_metrics.clone()
                } else {
                    failure.partial_metrics
                };
                emit(
                    sink,
                    LlmEvent::Error {
                        kind: failure.error.kind(),
                        message: failure.error.to_string(),
                        partial_metrics: Some(partial_metrics),
                    },
                );
                reply
            }
        };
        if let Err(e) = sink.on_end() {
            warn!("event sink on_end failed: {}", e);
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::NeverCancel;
    use crate::error::ErrorKind;
    use crate::events::CollectingSink;
    use serde_json::json;

    #[test]
    fn test_query_without_user_message_is_error_reply() {
        let runner = QueryRunner::from_config(ModelConfig::new("llama3", "ollama")).unwrap();
        let mut sink = CollectingSink::new();
        let reply = runner.query_messages(
            &[Message::system("only system")],
            false,
            &OptionBag::new(),
            &mut sink,
            &NeverCancel,
        );
        assert!(reply.is_error());
        assert_eq!(reply.error_kind(), Some(ErrorKind::Configuration));
        assert!(reply.final_response().starts_with("ERROR:"));
        assert_eq!(sink.kinds(), vec!["error"]);
    }

    #[test]
    fn test_query_uses_system_prompt_and_stream_flag() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/api/chat")
            .match_body(mockito::Matcher::PartialJson(json!({
                "stream": false,
                "messages": [
                    { "role": "system", "content": "Answer tersely." },
                    { "role": "user", "content": "6 x 7?" }
                ]
            })))
            .with_status(200)
            .with_body(r#"{"model":"llama3","message":{"role":"assistant","content":"42"},"done":true,"eval_count":2}"#)
            .create();

        let cfg = ModelConfig::new("llama3", "ollama")
            .with_api_base(server.url())
            .with_inference("stream", json!(false));
        let runner = QueryRunner::from_config(cfg)
            .unwrap()
            .with_system_prompt("Answer tersely.");
        let mut sink = CollectingSink::new();
        let reply = runner.query("6 x 7?", &mut sink, &NeverCancel);
        assert_eq!(reply.llm_response, "42");
        assert_eq!(reply.performance_metrics.eval_count, Some(2));
        // "Answer tersely.\n6 x 7?" は 22 文字
        assert_eq!(reply.performance_metrics.prompt_eval_count, Some(6));
        mock.assert();
    }

    #[test]
    fn test_blank_system_prompt_is_ignored() {
        let runner = QueryRunner::from_config(ModelConfig::new("m", "ollama"))
            .unwrap()
            .with_system_prompt("   ");
        assert!(runner.system_prompt.is_none());
    }

    #[test]
    fn test_query_timeout_from_config() {
        let cfg = ModelConfig::new("m", "ollama").with_option("query_timeout", json!(2.5));
        let runner = QueryRunner::from_config(cfg).unwrap();
        assert_eq!(
            runner.orchestrator.settings().query_timeout,
            Some(std::time::Duration::from_millis(2500))
        );
    }
}
