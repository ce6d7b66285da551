pub mod anthropic;
pub mod anthropic_stream;
pub mod guard;
pub mod local;
pub mod openai;
pub mod provider;
pub mod registry;
pub mod stream;
pub mod tokenizer;

pub use guard::ContextGuard;
pub use provider::{
    ChatMessage, ChatOutcome, ChatParams, ModelDescriptor, ProviderAdapter, ProviderError, Usage,
};
pub use registry::ModelRegistry;
pub use stream::StreamEvent;
pub use tokenizer::Tokenizer;
