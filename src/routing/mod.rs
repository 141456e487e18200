//! Route table and prefix matcher.
//!
//! # Data Flow
//! ```text
//! Incoming request (scheme, Host, path)
//!     → identity "scheme://host/path"
//!     → RouteTable::find (newest route first, literal prefix test)
//!     → Route (rule chain) or no match
//! ```
//!
//! The active table lives behind an `ArcSwap`; a request loads it once and
//! keeps that snapshot until it completes.

mod table;

pub use table::{Route, RouteTable};

use arc_swap::ArcSwap;
use std::sync::Arc;

pub type SharedRouteTable = Arc<ArcSwap<RouteTable>>;

pub fn shared_table(table: RouteTable) -> SharedRouteTable {
    Arc::new(ArcSwap::from_pointee(table))
}
