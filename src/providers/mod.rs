//! Provider abstraction for the hosted AI platform
//!
//! The rest of the crate consumes the platform through the
//! [`Provider`] trait; `hosted` is the production HTTP implementation.

pub mod base;
pub mod hosted;

pub use base::{
    CompletionEvent, CompletionStream, Provider, StoreInfo, TokenUsage, UploadPurpose,
    UploadedFile,
};
pub use hosted::HostedProvider;
