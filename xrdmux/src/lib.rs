//! xrdmux - redundant-read coordination for XRootD-federated storage.
//!
//! This library fronts a single logical remote file with up to two
//! concurrently open replica connections. It continuously compares the
//! replicas' observed quality, migrates traffic to healthier ones, splits
//! scattered reads across both in proportion to quality, and transparently
//! recovers from per-source failures by excluding the failing data server
//! and re-dispatching the affected request.
//!
//! The XRootD wire protocol itself is out of scope: the embedding
//! application supplies a [`transport::Transport`] implementation wrapping
//! its protocol client.
//!
//! # High-Level API
//!
//! ```ignore
//! use xrdmux::{ManagerConfig, RequestManager};
//! use xrdmux::transport::{OpenFlags, Permissions};
//!
//! let manager = RequestManager::open(
//!     transport,
//!     "root://cms-xrd-global.cern.ch//store/data/file.root",
//!     OpenFlags::READ,
//!     Permissions::default(),
//!     ManagerConfig::default(),
//! )
//! .await?;
//!
//! let header = manager.read_at(0, 16 * 1024).await?;
//! ```

pub mod chunk;
pub mod config;
pub mod error;
pub mod manager;
mod opener;
mod request;
mod source;
mod split;
pub mod transport;

pub use chunk::IoChunk;
pub use config::ManagerConfig;
pub use error::XrdError;
pub use manager::RequestManager;

/// Version of the xrdmux library.
///
/// Defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
