pub mod autofix;
pub mod context;
pub mod error;
pub mod followup;
pub mod gh;
pub mod models;
pub mod orchestrator;
pub mod prompts;
pub mod rate_limit;
pub mod review;
pub mod store;
pub mod triage;
pub mod verdict;

pub use error::GitHubError;
pub use models::{Finding, MergeVerdict, PrContext, PrReviewResult};
pub use orchestrator::GitHubOrchestrator;
pub use rate_limit::{RateLimiter, TokenBucket};
pub use store::GitHubStore;
