//! Wire protocol definitions for the deconfliction service
//!
//! The client uploads branch metadata and an object pack; the server
//! answers every request with a `multipart/mixed` stream interleaving
//! JSON control messages and opaque binary payloads.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// API version the client speaks when sending requests.
pub const API_REQUEST_VERSION: &str = "1";

/// API version the client expects in responses. A server advertising any
/// other value is a hard failure, not a negotiation.
pub const API_RESPONSE_VERSION: &str = "1";

/// Maximum size of a single response part (256 MB).
pub const MAX_PART_SIZE: usize = 256 * 1024 * 1024;

// Request headers.
pub const HDR_CLIENT_VERSION: &str = "DMerge-Client-Version";
pub const HDR_CLIENT_OS: &str = "DMerge-Client-OS";
pub const HDR_CLIENT_ARCH: &str = "DMerge-Client-Arch";
pub const HDR_CLIENT_API_VERSION: &str = "DMerge-Client-API-Version";
pub const HDR_GIT_VERSION: &str = "Git-Version";
pub const HDR_MAIN_REF: &str = "Main-Ref";
pub const HDR_TOPIC_REF: &str = "Topic-Ref";
pub const HDR_MAIN_SHA: &str = "Main-Sha";
pub const HDR_TOPIC_SHA: &str = "Topic-Sha";
pub const HDR_PACK_SIZE: &str = "Pack-Size";
pub const HDR_REMOTE: &str = "Remote";

// Response headers.
pub const HDR_SERVER_API_VERSION: &str = "DMerge-Server-API-Version";

// Part content types.
pub const PART_TYPE_JSON: &str = "application/json";
pub const PART_TYPE_BINARY: &str = "application/octet-stream";

/// Structured control message carried in a JSON part.
///
/// All fields are optional on the wire; unset fields are no-ops.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Text for the caller to write to stdout.
    #[serde(default)]
    pub stdout: String,
    /// Text for the caller to write to stderr.
    #[serde(default)]
    pub stderr: String,
    /// If > 0, the caller should exit with this code.
    #[serde(default)]
    pub exit_code: i32,
    /// Reference to create, paired with `sha`.
    #[serde(default, rename = "ref")]
    pub ref_name: String,
    /// Object id for `ref_name`.
    #[serde(default)]
    pub sha: String,
}

impl ControlMessage {
    /// The `(ref, sha)` pair to create, when both are present.
    pub fn ref_update(&self) -> Option<(&str, &str)> {
        if !self.ref_name.is_empty() && !self.sha.is_empty() {
            Some((&self.ref_name, &self.sha))
        } else {
            None
        }
    }
}

/// One decoded part of a streamed response.
#[derive(Debug)]
pub enum ResponseMessage {
    /// A JSON control message.
    Control(ControlMessage),
    /// An opaque binary payload; in the deconflict flow, an object pack
    /// to import into the local store.
    Binary(Bytes),
}
