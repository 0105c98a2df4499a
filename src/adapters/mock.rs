use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::SerialLink;
use crate::error::AppResult;

type Responder = Box<dyn FnMut(&str) -> AppResult<String> + Send>;

/// In-memory [`SerialLink`] whose replies come from a closure.
///
/// Every command is recorded and can be inspected through the handle
/// returned by [`ScriptedLink::transcript`].
pub struct ScriptedLink {
    name: String,
    responder: Responder,
    transcript: Arc<Mutex<Vec<String>>>,
}

impl ScriptedLink {
    /// Create a link answering each command with `responder(command)`.
    pub fn new(responder: impl FnMut(&str) -> AppResult<String> + Send + 'static) -> Self {
        Self {
            name: "scripted".to_string(),
            responder: Box::new(responder),
            transcript: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle on the list of commands written so far.
    pub fn transcript(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.transcript)
    }
}

#[async_trait]
impl SerialLink for ScriptedLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&mut self, command: &str) -> AppResult<()> {
        self.transcript.lock().push(command.to_string());
        (self.responder)(command).map(|_| ())
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        self.transcript.lock().push(command.to_string());
        (self.responder)(command)
    }
}
