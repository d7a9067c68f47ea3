//! The HTTP surface: route table, upstream proxy, control-plane API and the
//! server that ties them together.

pub mod control_plane;
pub mod proxy;
pub mod routes;
pub mod server;

pub use control_plane::{BalancerServiceStats, ControlPlaneRouter, ControlPlaneState};
pub use proxy::{proxy_handler, DispatchTimeouts, UpstreamProxy};
pub use routes::{Route, RouteMatch, RouteTable};
pub use server::Gateway;
