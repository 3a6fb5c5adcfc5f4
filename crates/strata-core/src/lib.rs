//! Core types for the Strata render hardware interface.
//!
//! This crate provides the backend-independent data model:
//! - Kind-tagged generational handles and the refcounted handle arena
//! - Queue classes and completion stamps
//! - Buffer, texture and view descriptions
//! - Device configuration and the core error type

pub mod arena;
pub mod config;
pub mod desc;
pub mod error;
pub mod handle;
pub mod queue;

pub use arena::HandleArena;
pub use config::DeviceConfig;
pub use desc::{
    BufferDesc, BufferUsage, BufferViewDesc, DescriptorClass, Format, MemoryDomain, TextureDesc,
    TextureDimension, TextureUsage, TextureViewDesc, ViewAccess, ViewDesc,
};
pub use error::{Error, Result};
pub use handle::{
    kind, BufferHandle, Handle, PipelineHandle, ResourceKind, TextureHandle, ViewHandle,
};
pub use queue::{CompletionStamp, QueueClass};
