//! Cursor pagination for append-only logs and keyed listings.
//!
//! # Usage
//!
//! ```rust,ignore
//! use fleetlog_core::pagination::{paginate_seq, scope, PageRequest};
//!
//! let phase = scope(&["task", "T1", "phase", "0"]);
//! let request = PageRequest::after(10).with_limit(25);
//! let page = paginate_seq(entries, &phase, request.resolve_seq(&phase)?, 25)?;
//! ```

mod cursor;
mod page;

pub use cursor::{scope, Cursor, CursorPosition};
pub use page::{paginate_keyed, paginate_seq, Page, PageRequest};
