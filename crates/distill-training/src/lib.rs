//! Distill Training
//!
//! Offline job runner for fine-tuning and knowledge distillation:
//! - Normalizing host job descriptors (`TrainDescriptor`, `EvalDescriptor`)
//! - Resolving datasets and models from the metadata store (`MetadataStore`)
//! - Running the optimization loop against a `ModelRuntime`
//! - Exporting artifacts and emitting a JSONL event stream (`EventSink`)
//! - Scoring trained versions (`eval`)

pub mod config;
pub mod dataset;
pub mod encode;
pub mod error;
pub mod eval;
pub mod events;
pub mod export;
pub mod hyperparams;
pub mod layout;
pub mod mode;
pub mod model;
pub mod persist;
pub mod pipeline;
pub mod runner;
pub mod runtime;
pub mod soft_labels;
pub mod store;
pub mod telemetry;
pub mod trainer;

pub use config::{merge_sources, EvalDescriptor, RawConfig, TrainDescriptor};
pub use dataset::{Dataset, DatasetSourceKind, EvalSample, Split, TrainingSample};
pub use error::{TrainingError, TrainingResult};
pub use events::{Event, EventSink, JsonlSink, MemorySink};
pub use layout::RunLayout;
pub use mode::TrainingMode;
pub use model::{ModelArtifact, ModelSpec};
pub use runner::{run_eval_job, run_train_job, JobEnv, EXIT_CANCELLED, EXIT_FAILED, EXIT_OK};
pub use runtime::{BuiltinRuntime, CausalLm, ModelRuntime, Tokenizer};
pub use store::MetadataStore;
