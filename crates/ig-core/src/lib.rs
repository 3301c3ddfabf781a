pub mod batch;
pub mod config;
pub mod element;
pub mod error;
pub mod history;
pub mod pool;
pub mod prompt;
pub mod random;
pub mod request;
pub mod retry;

pub use batch::{BatchRun, BatchSummary, GenerationResult, ItemError, ItemState, PersistedImage};
pub use config::GeneratorConfig;
pub use element::{Element, ElementCategory, ElementId, ElementSelection, ExhaustionPolicy, RepeatPolicy};
pub use error::{GenError, Result};
pub use history::PoolHistory;
pub use pool::{PoolManager, PoolPolicy};
pub use prompt::{BuiltPrompt, PromptBuilder, TemplateSet};
pub use random::{RandomSource, SecureRandom};
pub use request::{GenerationRequest, PoseMode, RunId};
