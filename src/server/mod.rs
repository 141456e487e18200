pub mod admin;
pub mod builder;
pub mod handler;
pub mod listener;

pub use admin::{spawn_admin_server, AdminService};
pub use builder::{serve_with_listener, ServerBuilder};
pub use handler::{PeerAware, RequestHandler};
