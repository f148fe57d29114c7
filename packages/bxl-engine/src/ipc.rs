//! The IPC provider collaborator (§6): "transport abstraction for IPC
//! pips; the core uses `send(payload) -> result` only."

use bxl_types::BuildError;

/// Minimal transport the executor needs to run an `Ipc` pip: send the pip's
/// payload to whatever moniker-addressed service owns it, and get back a
/// result blob or a failure. Everything about the transport (process pool,
/// network call, in-process dispatch) is the provider's own business.
pub trait IpcProvider: Send + Sync {
    fn send(&self, moniker: &str, payload: &[u8]) -> impl std::future::Future<Output = Result<Vec<u8>, BuildError>> + Send;
}

/// An in-memory provider for tests: a fixed table of moniker -> response.
pub struct StaticIpcProvider {
    responses: std::collections::HashMap<String, Vec<u8>>,
}

impl StaticIpcProvider {
    pub fn new() -> Self {
        Self {
            responses: std::collections::HashMap::new(),
        }
    }

    pub fn with_response(mut self, moniker: impl Into<String>, response: impl Into<Vec<u8>>) -> Self {
        self.responses.insert(moniker.into(), response.into());
        self
    }
}

impl Default for StaticIpcProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl IpcProvider for StaticIpcProvider {
    async fn send(&self, moniker: &str, _payload: &[u8]) -> Result<Vec<u8>, BuildError> {
        self.responses.get(moniker).cloned().ok_or_else(|| BuildError::InvalidInput {
            message: format!("no registered IPC moniker {moniker:?}"),
        })
    }
}
