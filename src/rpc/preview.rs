//! Typed client for the visual editor's preview frame.
//!
//! The preview runs inside the sandbox and answers DOM inspection and live-edit
//! calls over an [`RpcTransport`].

use super::{RpcError, RpcTransport};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// What the preview reports about one DOM element.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ElementInfo {
    /// Selector that addresses this element in later calls.
    pub selector: String,
    pub tag_name: String,
    pub id: Option<String>,
    pub class_names: Vec<String>,
    pub text_content: Option<String>,
    pub rect: Rect,
    pub computed_styles: BTreeMap<String, String>,
}

pub struct PreviewBridge {
    transport: Arc<RpcTransport>,
}

impl PreviewBridge {
    pub fn new(transport: Arc<RpcTransport>) -> Self {
        Self { transport }
    }

    /// Topmost element at viewport coordinates, if any.
    pub async fn get_element_at_point(&self, x: f64, y: f64) -> Result<Option<ElementInfo>, RpcError> {
        self.transport
            .call("getElementAtPoint", vec![json!(x), json!(y)])
            .await
    }

    pub async fn inspect_element(&self, selector: &str) -> Result<Option<ElementInfo>, RpcError> {
        self.transport
            .call("inspectElement", vec![json!(selector)])
            .await
    }

    /// Apply inline styles. Returns whether the element was found.
    pub async fn update_style(
        &self,
        selector: &str,
        styles: &BTreeMap<String, String>,
    ) -> Result<bool, RpcError> {
        self.transport
            .call("updateStyle", vec![json!(selector), json!(styles)])
            .await
    }

    /// Replace the element's text. Returns whether the element was found.
    pub async fn update_text(&self, selector: &str, text: &str) -> Result<bool, RpcError> {
        self.transport
            .call("updateText", vec![json!(selector), json!(text)])
            .await
    }

    pub async fn highlight_element(&self, selector: &str) -> Result<(), RpcError> {
        self.transport
            .call_method("highlightElement", vec![json!(selector)])
            .await
            .map(|_| ())
    }

    pub async fn clear_highlight(&self) -> Result<(), RpcError> {
        self.transport
            .call_method("clearHighlight", Vec::<Value>::new())
            .await
            .map(|_| ())
    }
}
