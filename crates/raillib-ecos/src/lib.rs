//! raillib-ecos: ESU ECoS backend for raillib.
//!
//! The ECoS speaks a line-oriented text protocol on TCP port 15471.
//! Requests look like `get(1000, speed, dir)`; the station answers with a
//! `<REPLY ...>` block and reports changes of subscribed objects in
//! unsolicited `<EVENT ...>` blocks, both terminated by `<END code (label)>`.
//!
//! # Architecture
//!
//! - [`protocol`] -- frame buffer, block parser and row tokenizer
//! - [`commands`] -- command builders and well-known object ids
//! - [`feedback`] -- feedback status word decoding
//! - [`managers`] -- live entity tables merged from decoded blocks
//! - [`io`] -- IO task types, spawn, and the select loop
//! - [`station`] -- [`EcosStation`], the [`CommandStation`](raillib_core::CommandStation)
//!   implementation
//! - [`builder`] -- [`EcosBuilder`]

pub mod builder;
pub mod commands;
pub mod feedback;
pub mod io;
pub mod managers;
pub mod protocol;
pub mod station;

pub use builder::EcosBuilder;
pub use managers::EntityManagers;
pub use protocol::{EcosMessage, FrameBuffer, ObjectRow};
pub use station::EcosStation;
