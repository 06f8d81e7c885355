//! cloudsync core library: event model, provider contract, registry, errors.
//!
//! Public API surface:
//! - [`types`]: newtypes, [`Event`] and [`ObjectInfo`]
//! - [`error`]: [`CloudError`] and [`RegistryError`]
//! - [`provider`]: the [`Provider`] capability trait and its requirement flags
//! - [`paths`]: normalisation and containment helpers for provider paths
//! - [`registry`]: explicit provider-name → constructor table
//! - [`config`]: YAML sync configuration load / save

pub mod config;
pub mod error;
pub mod paths;
pub mod provider;
pub mod registry;
pub mod types;

pub use config::{EngineSettings, SideConfig, SyncConfig};
pub use error::{CloudError, RegistryError};
pub use provider::{Credentials, EventBatch, Metadata, Provider, ProviderConfig};
pub use registry::{ProviderConstructor, ProviderRegistry};
pub use types::{ContentHash, Cursor, Event, OType, ObjectInfo, Oid, Side};
