//! DMerge Core Library
//!
//! Core functionality for DMerge including:
//! - Object model (ObjectId, ObjectKind, TreeEntry, ObjectSet)
//! - Toolchain adapter over an external `git` binary
//! - Divergence computation (unique ancestor, varying paths, pack assembly)
//! - Streaming multipart client for the deconfliction service

pub mod divergence;
pub mod object;
pub mod protocol;
pub mod toolchain;
pub mod transfer;

pub use divergence::{divergence_pack, unique_ancestor, varying_paths, DivergenceError};
pub use object::{ObjectId, ObjectKind, ObjectSet, TreeEntry};
pub use protocol::{
    ControlMessage, ResponseMessage, API_REQUEST_VERSION, API_RESPONSE_VERSION,
};
pub use toolchain::{GitToolchain, Toolchain, ToolchainError};
pub use transfer::{
    Client, ClientIdentity, DeconflictRequest, MultipartDecoder, ResponseStream, TransferError,
};
