//! Transport implementations for raillib.
//!
//! This crate provides concrete implementations of the
//! [`Transport`](raillib_core::Transport) trait from `raillib-core`:
//!
//! - [`TcpTransport`]: TCP connections to network-attached command stations
//!   such as the ESU ECoS (port [`ECOS_DEFAULT_PORT`]).

pub mod tcp;

pub use tcp::{ECOS_DEFAULT_PORT, TcpTransport};
