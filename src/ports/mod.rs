//! Port traits. API boundaries for the hexagon.
//!
//! The application calls outward through these; adapters implement them.

pub mod gateway;

pub use gateway::{
    ChatGateway, GatewayFactory, MediaStream, OutgoingMedia, PublishItem, StagedMessage, SELF_CHAT,
};
