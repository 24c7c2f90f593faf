//! Broker message body parsing.
//!
//! The control plane names a parser per queue; today all queues carry JSON
//! `MessagePointer` envelopes, but the type keeps the seam open.

use relay_common::MessagePointer;

use crate::{QueueError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParserType {
    #[default]
    MessagePointer,
}

impl ParserType {
    /// Resolve a parser from control-plane configuration. Unknown names fall
    /// back to the pointer parser rather than failing the whole queue.
    pub fn from_config(name: Option<&str>) -> Self {
        match name.map(|n| n.to_ascii_lowercase()) {
            Some(n) if n == "pointer" || n == "messagepointer" => ParserType::MessagePointer,
            Some(other) => {
                tracing::warn!(parser = %other, "Unknown parser type, using message pointer parser");
                ParserType::MessagePointer
            }
            None => ParserType::MessagePointer,
        }
    }

    pub fn parse(&self, body: &str) -> Result<MessagePointer> {
        match self {
            ParserType::MessagePointer => {
                let message: MessagePointer = serde_json::from_str(body)?;
                if message.id.is_empty() {
                    return Err(QueueError::Config("message id is empty".to_string()));
                }
                Ok(message)
            }
        }
    }
}
