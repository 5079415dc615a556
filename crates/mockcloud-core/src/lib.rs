//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary orchestration and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Resource model, store and asynchronous lifecycle engine of the mock cloud
//! control plane.

pub mod cidr;
pub mod dispatcher;
pub mod error;
pub mod jobs;
pub mod journal;
pub mod model;
pub mod runtime;
pub mod service;
pub mod store;
pub mod worker;

pub use dispatcher::{ChannelDispatcher, DispatchError, JobDispatcher, JobHandle};
pub use error::{ServiceError, StoreError};
pub use jobs::{Job, JobKind, JobLedger, JobRecord, JobStatus};
pub use model::{LifecycleState, ResourceKind};
pub use runtime::{ControlPlane, ControlPlaneHandle};
pub use service::{Accepted, ResourceService, ServiceResult};
pub use store::ResourceStore;
pub use worker::{JobOutcome, LifecycleWorker, WorkerPool};
