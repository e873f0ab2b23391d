//! JSON request/response envelope of the conversion endpoint.

use crate::{Error, Result};
use base64::Engine as Base64Engine;
use log::debug;
use serde::{Deserialize, Serialize};

/// Body of `POST /convert`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConvertRequest {
    /// Raw HTML markup
    #[serde(default)]
    pub html: String,
    /// Standard base64 encoded HTML; takes precedence over `html`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_base64: Option<String>,
    /// Skip inline embedding and render from a local content server
    #[serde(default)]
    pub use_local_server: bool,
}

impl ConvertRequest {
    /// The HTML to render, decoding `html_base64` when present.
    pub fn html(&self) -> Result<String> {
        if let Some(encoded) = self.html_base64.as_deref().filter(|s| !s.is_empty()) {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| Error::InvalidRequest(format!("invalid base64 encoding: {}", e)))?;
            let html = String::from_utf8(decoded)
                .map_err(|e| Error::InvalidRequest(format!("decoded HTML is not UTF-8: {}", e)))?;
            debug!("Using base64-decoded HTML content");
            return Ok(html);
        }
        if !self.html.is_empty() {
            debug!("Using raw HTML content");
            return Ok(self.html.clone());
        }
        Err(Error::InvalidRequest(
            "HTML content must not be empty (provide 'html' or 'html_base64')".into(),
        ))
    }
}

/// Body of every `/convert` reply
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConvertResponse {
    pub success: bool,
    /// Base64 encoded image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConvertResponse {
    pub fn image(bytes: &[u8]) -> Self {
        Self {
            success: true,
            data: Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}
