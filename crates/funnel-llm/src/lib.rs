pub mod extract;
pub mod transport;

pub use extract::{extract_json, JsonMode};
pub use transport::{ChatClient, ChatCompletion, ChatMessage, ChatRequest, TransportError};
