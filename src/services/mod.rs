pub mod job_source;
pub mod metrics;
pub mod predictor;
pub mod queue;
pub mod sink;
pub mod storage;
pub mod thumbnails;
