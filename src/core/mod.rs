pub mod browser;
pub mod config;

pub use browser::BrowserTrait;
pub use config::{ArtifactConfig, BrowserConfig, Config, LocatorConfig, TimingConfig};
