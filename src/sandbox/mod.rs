//! Sandbox records and the in-memory state store.

pub mod models;
pub mod store;

pub use models::{
    BatchConversationSandbox, BatchConversationsRequest, CommandSpec, ImageExistsResponse,
    ListResponse, PodStatus, RegistryPrefixResponse, RuntimeIdRequest, RuntimeResponse,
    SandboxRecord, SandboxStatus, StartRequest,
};
pub use store::{StateStore, StoreError};
