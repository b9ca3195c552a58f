//! Tool registry used by the runtime to advertise and look up tool schemas.

use std::collections::HashMap;

use proto::{InvocationError, ToolDefinition};
use tools::ToolSpec;
use tracing::debug;

/// Registry of available tools, kept in registration order.
pub struct ToolRegistry {
    specs: Vec<ToolSpec>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    /// Creates an empty tool registry.
    pub fn new() -> Self {
        Self {
            specs: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Registry holding the built-in tool set.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for spec in tools::builtin_specs() {
            registry.register(spec);
        }
        registry
    }

    /// Register a tool; a later spec with the same name replaces the earlier one.
    pub fn register(&mut self, spec: ToolSpec) {
        debug!("Registering tool: {}", spec.name);
        match self.index.get(&spec.name) {
            Some(&i) => self.specs[i] = spec,
            None => {
                self.index.insert(spec.name.clone(), self.specs.len());
                self.specs.push(spec);
            }
        }
    }

    /// Get tool definitions for the LLM
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.specs.iter().map(ToolSpec::definition).collect()
    }

    pub fn get(&self, name: &str) -> Result<&ToolSpec, InvocationError> {
        self.index
            .get(name)
            .map(|&i| &self.specs[i])
            .ok_or_else(|| InvocationError::UnknownTool(name.to_string()))
    }

    /// Returns the list of registered tool names.
    pub fn tool_names(&self) -> Vec<&str> {
        self.specs.iter().map(|s| s.name.as_str()).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
