//! マルチプロバイダ LLM クライアントのコア
//!
//! - provider: ベンダーごとのドライバー（OpenAI 互換 / Ollama）
//! - client: 設定をマージしてドライバーに渡すファサード
//! - orchestrator: ストリーム処理、思考／回答の分離、メトリクス計測
//! - factory: client_type からドライバーを選ぶ

pub mod cancel;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod factory;
pub mod message;
pub mod metrics;
pub mod orchestrator;
pub mod provider;
pub mod reply;
pub mod runner;
pub mod think;
pub mod tokens;
pub mod transcript;

pub use cancel::{CancelFlag, CancelSignal, NeverCancel};
pub use client::LlmClient;
pub use clock::{Clock, StdClock};
pub use config::{ClientType, ModelConfig, ModelsFile, OptionBag};
pub use error::{Error, ErrorKind};
pub use events::{CollectingSink, EventHub, EventSink, LlmEvent, NullSink};
pub use factory::{create_provider, AnyProvider};
pub use message::{Message, Role};
pub use metrics::Metrics;
pub use orchestrator::{OrchestratorSettings, RequestContext, ResponseOrchestrator};
pub use provider::{ChatResponse, Delta, LlmProvider};
pub use reply::{Reply, ReplyStatus};
pub use runner::QueryRunner;
pub use think::{split_thinking, ThinkSplit, ThinkStreamParser};
pub use tokens::{estimate_tokens, HeuristicTokenCounter, TokenCounter};
pub use transcript::JsonlEventSink;
