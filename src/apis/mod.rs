mod jobs;
pub mod pipelines;
pub mod query;
pub mod workflow;

// Re-export all APIs
pub use pipelines::{PipelineJob, PipelinesApi};
pub use query::{ExecuteOptions, Query, QueryApi};
pub use workflow::{WorkflowApi, WorkflowJob};
