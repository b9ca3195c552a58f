use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{GeneratedMedia, GenerationRequest, LocalImageBackend, MediaBackend};

/// Dispatches each request to the backend registered for its tool name,
/// falling back to a default backend when one is set.
#[derive(Default)]
pub struct BackendRouter {
    routes: HashMap<String, Arc<dyn MediaBackend>>,
    fallback: Option<Arc<dyn MediaBackend>>,
}

impl BackendRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Router with the local transforms registered and `remote` handling
    /// every other tool.
    pub fn with_local_transforms(remote: Option<Arc<dyn MediaBackend>>) -> Self {
        let local: Arc<dyn MediaBackend> = Arc::new(LocalImageBackend::new());
        let mut router = Self::new();
        for tool in LocalImageBackend::supported_tools() {
            router = router.route(*tool, local.clone());
        }
        router.fallback = remote;
        router
    }

    pub fn route(mut self, tool: impl Into<String>, backend: Arc<dyn MediaBackend>) -> Self {
        self.routes.insert(tool.into(), backend);
        self
    }

    pub fn fallback(mut self, backend: Arc<dyn MediaBackend>) -> Self {
        self.fallback = Some(backend);
        self
    }

    fn backend_for(&self, tool: &str) -> Option<&Arc<dyn MediaBackend>> {
        self.routes.get(tool).or(self.fallback.as_ref())
    }
}

#[async_trait]
impl MediaBackend for BackendRouter {
    async fn generate(&self, request: GenerationRequest) -> Result<GeneratedMedia, String> {
        let backend = self
            .backend_for(&request.tool_name)
            .ok_or_else(|| format!("no backend configured for tool '{}'", request.tool_name))?;
        backend.generate(request).await
    }
}
