//! `initialize` handshake.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::context::RequestContext;
use crate::errors::RpcError;
use crate::registry::RequestHandler;

/// Newest protocol revision this crate speaks.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-11-25";

/// Every protocol revision accepted during negotiation, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-11-25", "2025-06-18", "2025-03-26"];

/// Name and version of a peer implementation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Implementation name.
    pub name: String,
    /// Implementation version.
    pub version: String,
}

impl Implementation {
    /// Construct from name and version.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Result of a successful `initialize`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Negotiated protocol version.
    pub protocol_version: String,
    /// Server capabilities.
    #[serde(default)]
    pub capabilities: Value,
    /// Server identity.
    pub server_info: Implementation,
    /// Optional usage instructions for the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    protocol_version: String,
}

/// Answers `initialize` with version negotiation.
#[derive(Clone, Debug)]
pub struct InitializeHandler {
    server_info: Implementation,
    capabilities: Value,
    instructions: Option<String>,
    supported_versions: Vec<String>,
}

impl InitializeHandler {
    /// Handler advertising `server_info`, no capabilities and every
    /// supported version.
    pub fn new(server_info: Implementation) -> Self {
        Self {
            server_info,
            capabilities: json!({}),
            instructions: None,
            supported_versions: SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| (*v).to_owned())
                .collect(),
        }
    }

    /// Advertise capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Value) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Attach instructions.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Restrict the accepted versions (newest first). An empty list keeps
    /// the defaults.
    #[must_use]
    pub fn with_supported_versions(mut self, versions: Vec<String>) -> Self {
        if !versions.is_empty() {
            self.supported_versions = versions;
        }
        self
    }

    /// The requested version when supported, otherwise the newest one.
    pub fn negotiate(&self, requested: &str) -> String {
        if self.supported_versions.iter().any(|v| v == requested) {
            return requested.to_owned();
        }
        self.supported_versions
            .first()
            .cloned()
            .unwrap_or_else(|| LATEST_PROTOCOL_VERSION.to_owned())
    }
}

#[async_trait]
impl RequestHandler for InitializeHandler {
    async fn handle(&self, params: Option<Value>, ctx: RequestContext) -> Result<Value, RpcError> {
        let params: InitializeParams = serde_json::from_value(
            params.ok_or_else(|| RpcError::invalid_params("initialize requires params"))?,
        )?;
        let version = self.negotiate(&params.protocol_version);
        info!(
            request_id = %ctx.request_id(),
            requested = %params.protocol_version,
            negotiated = %version,
            "initialize"
        );
        let result = InitializeResult {
            protocol_version: version,
            capabilities: self.capabilities.clone(),
            server_info: self.server_info.clone(),
            instructions: self.instructions.clone(),
        };
        serde_json::to_value(result).map_err(|e| RpcError::internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> InitializeHandler {
        InitializeHandler::new(Implementation::new("tern-test", "0.1.0"))
    }

    #[test]
    fn negotiate_keeps_supported_version() {
        assert_eq!(handler().negotiate("2025-06-18"), "2025-06-18");
    }

    #[test]
    fn negotiate_falls_back_to_latest() {
        assert_eq!(handler().negotiate("1999-01-01"), LATEST_PROTOCOL_VERSION);
    }

    #[test]
    fn restricted_versions() {
        let h = handler().with_supported_versions(vec!["2025-03-26".into()]);
        assert_eq!(h.negotiate("2025-11-25"), "2025-03-26");
        let h = handler().with_supported_versions(vec![]);
        assert_eq!(h.negotiate("2025-11-25"), "2025-11-25");
    }

    #[test]
    fn initialize_result_wire_shape() {
        let result = InitializeResult {
            protocol_version: "2025-06-18".into(),
            capabilities: json!({"tools": {}}),
            server_info: Implementation::new("s", "1"),
            instructions: None,
        };
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["protocolVersion"], "2025-06-18");
        assert_eq!(v["serverInfo"]["name"], "s");
        assert!(v.get("instructions").is_none());
    }
}
