//! AiSEG2 Bridge Library
//!
//! Polls a Panasonic AiSEG2 home-energy monitor over its Digest-protected web UI, turns
//! the scraped pages into typed readings, and republishes them to Home Assistant.

pub mod climate;
pub mod config;
pub mod data_coordinator;
pub mod digest;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod home_assistant;
pub mod home_assistant_publisher;
pub mod normalizer;
pub mod poller;
pub mod reading;
pub mod session;

// Re-export commonly used types for easier access
pub use config::{AppConfig, DeviceEndpoint, PollSettings};
pub use data_coordinator::DataCoordinator;
pub use error::{AuthError, ConfigError, ExtractError, FetchError, NormalizeError, PollError};
pub use fetcher::{DeviceClient, PageId, PageSource};
pub use home_assistant_publisher::HomeAssistantPublisher;
pub use poller::{CycleState, Poller, Snapshot};
pub use reading::{PollResult, Reading, ReadingKind, Unit};
