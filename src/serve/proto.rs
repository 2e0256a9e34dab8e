//! The WebSocket wire protocol. Every frame is a JSON object carrying
//! `type`; field names are camelCase on the wire.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::row::Value;
use crate::template::PatchOp;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Event(EventFrame),
    Ping,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    pub block_id: String,
    pub action: String,
    #[serde(default)]
    pub params: IndexMap<String, Value>,
    /// `lvt-data-*` attributes from the target element, keyed by suffix.
    #[serde(default)]
    pub data_attrs: IndexMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Hello {
        page_version: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        operator: Option<String>,
    },
    Tree {
        html: String,
    },
    Patch {
        ops: Vec<PatchOp>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        source_name: String,
        kind: ErrorKind,
        message: String,
    },
    Reload,
    Close {
        reason: String,
    },
}
