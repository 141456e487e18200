//! Control plane: builds route tables from configuration and keeps the
//! active table current.
//!
//! All mutations funnel through [`ControlPlane`], whose writer lock makes
//! it the single writer. Reload triggers, health failures and control
//! messages arrive on channels and are applied by [`ControlPlane::run`].

mod builder;
mod events;
mod message;
mod plane;

pub use builder::ChainBuilder;
pub use events::{sink_from_settings, Event, EventError, EventKind, EventSink, LogEventSink, RestEventSink};
pub use message::{ControlMessage, MembershipBody};
#[cfg(unix)]
pub use plane::spawn_signal_reload;
pub use plane::{
    control_channels, spawn_refresh, ControlChannels, ControlPlane, ControlReceivers, JoinOutcome,
    LeaveOutcome, ReloadTrigger,
};
