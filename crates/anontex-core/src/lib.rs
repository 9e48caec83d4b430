pub mod anonymize;
pub mod config;
pub mod deanonymize;
pub mod detection;
pub mod error;
pub mod faker;
pub mod mapping;
pub mod proxy;
pub mod server;

pub use anonymize::{AnonymizationEngine, Anonymized};
pub use config::{Config, DetectionConfig, FakerConfig, MappingConfig, ProxyConfig, Span};
pub use deanonymize::DeanonymizationEngine;
pub use detection::{Detector, RecognizerSet, RuleDetector};
pub use error::{AnontexError, Result};
pub use faker::FakerEngine;
pub use mapping::{FakeMapping, MappingRecord, MappingStatistics, MappingStore};
pub use proxy::{PipelineState, ProxyPipeline, ProxyRequestContext};
pub use server::{build_router, spawn_expiry_sweeper, AppContext};
