//! Enigma2 receiver configuration formats.
//!
//! This crate implements the textual and positional encodings used by the
//! receiver's configuration file set:
//!
//! - colon-delimited service reference strings (`fav_id`) and the
//!   comma-delimited flag/CAS/PID token list ([`reference`])
//! - bouquet index and user bouquet files ([`bouquet`])
//! - the `satellites.xml` tuning descriptor with its numeric coding
//!   tables ([`satellites`])
//! - parental lock block/allow lists ([`blacklist`])
//! - the fixed file names that make up each data subset ([`files`])
//!
//! Everything here is pure encode/decode logic: no sockets, no sessions.
//! Batch parsers tolerate single bad records (log and skip); only a
//! structurally broken document is an error.
//!
//! # Example
//!
//! ```rust
//! use e2sync_formats::reference::{Flag, ServiceRef};
//!
//! let r = ServiceRef::parse("1:0:19:2B66:3F3:1:C00000:0:0:0:").unwrap();
//! assert_eq!(r.sid, 0x2B66);
//! assert_eq!(r.picon_id(), "1_0_19_2B66_03F3_0001_00C00000_0_0_0.png");
//!
//! assert_eq!(Flag::parse("f:08").unwrap(), 8);
//! assert!(Flag::is_pids(4));
//! ```

pub mod blacklist;
pub mod bouquet;
pub mod error;
pub mod files;
pub mod reference;
pub mod satellites;

pub use error::FormatError;
pub use reference::{Flag, Service, ServiceRef};
pub use satellites::{Satellite, Transponder};
