pub mod openai_compatible;
pub mod registry;

pub use openai_compatible::{Completion, CompletionBackend, CompletionRequest, OpenAICompatibleBackend};
pub use registry::{wire_model_name, ProviderFamily, ProviderRegistry, DEFAULT_FAMILY};
