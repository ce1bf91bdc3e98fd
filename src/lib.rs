/*
 * Nextcode client - Rust client for the pipelines, query and workflow REST services
 */

// Internal modules
mod client;
pub mod models;
pub mod apis;
mod error;
mod auth;
pub mod config;
mod session;
pub mod template;
pub mod utils;
pub mod weblog;

// Re-export public types and interfaces
pub use client::{NextcodeClient, NextcodeClientBuilder, ServiceKind};
pub use models::*;
pub use apis::*;
pub use error::{NextcodeError, NextcodeResult};
pub use auth::{decode_token, get_access_token, root_url_from_api_key, ApiKeyAuth, Authentication, BearerAuth, Claims, NoAuth};
pub use config::{CacheStore, Config, Profile, RetryPolicy};
pub use session::{Service, ServiceSession};
pub use template::{CellTarget, GorCell, VirtualRelation};
pub use weblog::Weblog;

// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        NextcodeClient,
        NextcodeError, NextcodeResult,
        Service,
        QueryApi, Query, ExecuteOptions,
        WorkflowApi, WorkflowJob,
        PipelinesApi, PipelineJob,
        // Common model types
        JobFilter, JobRef, PostJobRequest, QueryStatus, ResultOptions, ResultSet,
        VirtualRelation,
    };
}
