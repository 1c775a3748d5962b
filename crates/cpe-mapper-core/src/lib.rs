pub mod config;
pub mod cpe;
pub mod llm;
pub mod mapping;
pub mod normalize;
pub mod nvd;
pub mod prompt_loader;
pub mod rate;
pub mod resolver;

#[cfg(test)]
pub mod integration_tests;

pub use config::{Config, LlmConfig, MappingConfig, NvdConfig};
pub use llm::{CpeSuggest, LlmClient};
pub use mapping::{CpeMapping, ManualAction, MappingStatistics, MappingStore, MatchMethod};
pub use normalize::NameNormalizer;
pub use nvd::{CpeSearch, NvdClient, SearchHit};
pub use prompt_loader::PromptLoader;
pub use rate::RateGate;
pub use resolver::{BatchItem, CpeResolver, LookupRequest, LookupResult, ManualOutcome};
