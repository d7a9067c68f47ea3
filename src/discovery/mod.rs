//! Service discovery: the registry of named services, health tracking,
//! instance resolution and registry change events.

pub mod events;
pub mod health;
pub mod prober;
pub mod registry;
pub mod resolver;

pub use events::{BroadcastPublisher, EventPublisher, RegistryEvent, Subscription};
pub use health::{HealthTracker, HealthUpdate};
pub use prober::HealthProber;
pub use registry::{Selection, ServiceGroup, ServiceRegistry};
pub use resolver::{ConnectionGuard, Discovery, HostResolution, Lease};
