//! Multi-worker health-checking engine core.
//!
//! Embeds into a reverse proxy or load balancer: register targets, feed
//! in passive observations from real traffic, optionally let the engine
//! run its own active probes, and read back a live healthy/unhealthy
//! verdict per target. See each module for its slice of the design.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod health;
pub mod lock;
pub mod observability;
pub mod prober;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod target;

pub use config::Config;
pub use engine::Engine;
pub use error::{Result, SentinelError};
pub use events::{EventBus, EventSubscription, HealthEvent, InProcessBus};
pub use health::InternalHealth;
pub use store::{MemoryStore, NamedLock, SharedStore};
pub use target::Target;
