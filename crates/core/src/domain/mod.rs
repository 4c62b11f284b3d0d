//! Domain entities and business rules

pub mod audio;
pub mod backend;
pub mod config;
pub mod matrix;
pub mod mixer;
pub mod router;
pub mod server;

// Re-export specific items to avoid ambiguous glob imports
pub use audio::{AudioError, Driver, DriverId, SpeakerMode, Usage};
pub use backend::{AudioBackend, AudioSession, GroupHandle};
pub use config::{BackendKind, ConfigError, ConfigManager, EarConfig, ZoneTemplate};
pub use matrix::Matrix;
pub use mixer::{Channel, ChannelId, ChannelZone, Speaker, SpeakerGroup, Zone, ZoneId, ZoneTree};
pub use router::{Router, RouterState};
pub use server::{DispatchError, Method, Scope, Server, SessionId};
