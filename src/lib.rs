//! tg-mirror: bulk Telegram channel history retrieval with a multi-session
//! pool, and optional staged re-publishing to target channels.

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod shared;
pub mod usecases;
