pub mod job;
pub mod prediction;
pub mod verdict;

pub use job::{Job, JobState, ThumbnailAsset};
pub use prediction::{Gender, InferenceUnit, PredictionResult};
pub use verdict::{UserVerdict, VerdictStatus};
