//! Configuration sync client for Enigma2 receivers.
//!
//! Moves bouquet sets, the service database, tuning descriptors and
//! picons between a local working directory and a receiver, over the
//! receiver's stock services: FTP for transfers, telnet or the web
//! interface to quiesce and revive the UI around uploads.
//!
//! File format handling lives in the `e2sync-formats` crate; this crate
//! owns the sessions and the orchestration. The entry point is
//! [`sync::Syncer`], which runs one operation at a time and streams
//! [`sync::SyncEvent`]s while it works.

pub mod backup;
pub mod error;
pub mod ftp;
pub mod http;
pub mod logging;
pub mod profile;
pub mod sync;
pub mod telnet;

pub use error::SyncError;
pub use profile::{ControlSurface, Profile};
pub use sync::{SyncEvent, SyncKind, SyncOptions, Syncer};
