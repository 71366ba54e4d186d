#![forbid(unsafe_code)]
//! A 9P2000 protocol engine for resource-constrained environments.
//!
//! This crate implements the wire codec, server request dispatcher,
//! client request/response multiplexer, fid table, session pool, and
//! union filesystem composer that make up the 9P2000 distributed
//! filesystem protocol, as a transport- and backend-agnostic library.
//! It does not ship any concrete transport I/O or filesystem backend
//! beyond the union composer: applications plug those in through the
//! [`transport::Transport`] and [`srv::Filesystem`] traits.
//!
//! # Getting started
//!
//! To serve a namespace, implement [`srv::Filesystem`] for your
//! backend and hand it to [`srv::serve`] along with a
//! [`transport::Transport`]:
//!
//! ```no_run
//! use async_trait::async_trait;
//! use std::sync::Arc;
//! use ninep::{
//!     config::Config,
//!     error::Error,
//!     fcall::{QId, QIdType, Stat},
//!     srv::{Filesystem, serve},
//!     transport::ChannelTransport,
//!     Result,
//! };
//!
//! #[derive(Clone)]
//! struct Empty;
//!
//! #[async_trait]
//! impl Filesystem for Empty {
//!     type Node = ();
//!
//!     fn get_root(&self) -> Self::Node {}
//!
//!     fn node_qid(&self, _node: &Self::Node) -> QId {
//!         QId { typ: QIdType::DIR, version: 0, path: 0 }
//!     }
//!
//!     async fn walk(&self, _parent: &Self::Node, _name: &str) -> Option<Self::Node> {
//!         None
//!     }
//!
//!     async fn open(&self, _node: &Self::Node, _mode: u8) -> Result<()> {
//!         Ok(())
//!     }
//!
//!     async fn read(&self, _node: &Self::Node, _offset: u64, _count: u32, _uname: &str) -> Result<Vec<u8>> {
//!         Ok(Vec::new())
//!     }
//!
//!     async fn write(&self, _node: &Self::Node, _offset: u64, _data: &[u8], _uname: &str) -> Result<u32> {
//!         Ok(0)
//!     }
//!
//!     async fn stat(&self, _node: &Self::Node) -> Result<Stat> {
//!         Err(Error::backend("no stat"))
//!     }
//!
//!     async fn create(&self, _parent: &Self::Node, _name: &str, _perm: u32, _mode: u8, _uname: &str) -> Result<Self::Node> {
//!         Err(Error::backend("read-only"))
//!     }
//!
//!     async fn remove(&self, _node: &Self::Node) -> Result<()> {
//!         Err(Error::backend("read-only"))
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let (server_side, _client_side) = ChannelTransport::pair();
//! serve(Arc::new(Empty), Arc::new(server_side), Config::default(), None).await
//! # }
//! ```
//!
//! Clients drive a session through [`client::Client`], which owns a
//! background task draining the transport's inbound frames into
//! per-tag response slots so many callers can have requests
//! outstanding on one connection simultaneously.
//!
//! # Scope
//!
//! In scope: the wire codec, fid/tag tables, server dispatcher, client
//! multiplexer, session pool, transport framing contract, and the
//! union/synthetic filesystem composer. Out of scope (external
//! collaborators): concrete transport I/O, RTOS kernel primitives, and
//! concrete filesystem backends beyond the composer — those are
//! consumed through [`transport::Transport`] and [`srv::Filesystem`].
//! Authentication cryptography, wire encryption, 9P2000.u/9P2000.L
//! extensions, file locking, and symbolic links are non-goals; see
//! [`auth`] for the auth handshake state machine this crate does own.
#[macro_use]
pub mod utils;

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod fcall;
pub mod fid;
pub mod pool;
pub mod serialize;
pub mod srv;
pub mod tag;
pub mod transport;
pub mod union;

pub use crate::error::Error;
pub use crate::error::errno;
pub use crate::fcall::*;
pub use crate::utils::Result;
