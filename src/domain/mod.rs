//! Core domain layer. No external I/O dependencies.
//!
//! Entities and business rules live here. Dependencies flow inward.

pub mod entities;
pub mod errors;
pub mod groups;
pub mod media;

pub use entities::{
    AccountInfo, ChatInfo, DownloadedItem, FileLocation, FileRef, ItemPayload, MediaDescriptor,
    MediaMeta, Message, StagedItem,
};
pub use errors::{DomainError, ErrorCategory, ErrorRecord, Severity};
pub use groups::{ClientAssignment, Distribution, GroupCollection, MessageGroup};
pub use media::{KindFamily, MediaKind, PublishClass};
