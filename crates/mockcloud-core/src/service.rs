//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Request validation and job submission for every resource."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use mockcloud_common::config::CatalogConfig;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::dispatcher::{DispatchError, JobDispatcher};
use crate::error::ServiceError;
use crate::jobs::{Job, JobLedger, JobRecord};
use crate::model::{
    CreateEnvironment, CreateSecurityGroup, CreateVm, CreateVolume, Environment, LifecycleState,
    ListQuery, Page, ResourceKind, SecurityGroup, Vm, Volume,
};
use crate::store::{ResourceStore, StateChange};

pub type ServiceResult<T> = Result<T, ServiceError>;

/// A record whose lifecycle job has been handed to the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Accepted<T> {
    #[serde(flatten)]
    pub record: T,
    pub job_id: Uuid,
}

/// Entry point used by the HTTP layer.
///
/// VM and Volume creation and deletion return as soon as the record is
/// written and its job dispatched; everything else completes synchronously.
#[derive(Debug)]
pub struct ResourceService {
    store: Arc<ResourceStore>,
    dispatcher: Arc<dyn JobDispatcher>,
    ledger: Arc<JobLedger>,
    catalog: CatalogConfig,
}

impl ResourceService {
    pub fn new(
        store: Arc<ResourceStore>,
        dispatcher: Arc<dyn JobDispatcher>,
        ledger: Arc<JobLedger>,
        catalog: CatalogConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            ledger,
            catalog,
        }
    }

    pub fn store(&self) -> &Arc<ResourceStore> {
        &self.store
    }

    pub fn catalog(&self) -> &CatalogConfig {
        &self.catalog
    }

    // Environments

    pub fn create_environment(&self, request: CreateEnvironment) -> ServiceResult<Environment> {
        let validated = request.validate()?;
        let environment = self.store.create_environment(validated)?;
        info!(
            environment_id = %environment.id,
            name = %environment.name,
            network_cidr = %environment.network_cidr,
            "environment created"
        );
        Ok(environment)
    }

    pub fn get_environment(&self, id: Uuid) -> ServiceResult<Environment> {
        Ok(self.store.get_environment(id)?)
    }

    pub fn list_environments(&self, query: &ListQuery) -> ServiceResult<Page<Environment>> {
        Ok(self.store.list_environments(query.skip(), query.limit()?))
    }

    pub fn delete_environment(&self, id: Uuid) -> ServiceResult<Environment> {
        let environment = self.store.delete_environment(id)?;
        info!(environment_id = %id, "environment deleted");
        Ok(environment)
    }

    // Security groups

    pub fn create_security_group(
        &self,
        request: CreateSecurityGroup,
    ) -> ServiceResult<SecurityGroup> {
        let validated = request.validate()?;
        let group = self.store.create_security_group(validated)?;
        info!(
            security_group_id = %group.id,
            environment_id = %group.environment_id,
            rules = group.rules.len(),
            "security group created"
        );
        Ok(group)
    }

    pub fn get_security_group(&self, id: Uuid) -> ServiceResult<SecurityGroup> {
        Ok(self.store.get_security_group(id)?)
    }

    pub fn list_security_groups(&self, query: &ListQuery) -> ServiceResult<Page<SecurityGroup>> {
        Ok(self.store.list_security_groups(query, query.limit()?))
    }

    pub fn delete_security_group(&self, id: Uuid) -> ServiceResult<SecurityGroup> {
        let group = self.store.delete_security_group(id)?;
        info!(security_group_id = %id, "security group deleted");
        Ok(group)
    }

    // Virtual machines

    pub fn create_vm(&self, request: CreateVm) -> ServiceResult<Accepted<Vm>> {
        let validated = request.validate(&self.catalog.instance_types)?;
        let job_id = Uuid::new_v4();
        let vm = self.store.insert_vm(validated, job_id)?;
        info!(vm_id = %vm.id, name = %vm.name, instance_type = %vm.instance_type, "vm creation requested");
        let job = Job::create(ResourceKind::Vm, vm.id).with_id(job_id);
        self.dispatch(job, LifecycleState::Pending)?;
        Ok(Accepted { record: vm, job_id })
    }

    pub fn get_vm(&self, id: Uuid) -> ServiceResult<Vm> {
        Ok(self.store.get_vm(id)?)
    }

    pub fn list_vms(&self, query: &ListQuery) -> ServiceResult<Page<Vm>> {
        Ok(self.store.list_vms(query, query.limit()?))
    }

    pub fn delete_vm(&self, id: Uuid) -> ServiceResult<Accepted<Vm>> {
        let job = Job::delete(ResourceKind::Vm, id);
        let vm = self.store.begin_vm_delete(id, job.id)?;
        info!(vm_id = %id, job_id = %job.id, "vm deletion requested");
        let job_id = self.dispatch(job, LifecycleState::Deleting)?;
        Ok(Accepted { record: vm, job_id })
    }

    // Volumes

    pub fn create_volume(&self, request: CreateVolume) -> ServiceResult<Accepted<Volume>> {
        let validated = request.validate()?;
        let job_id = Uuid::new_v4();
        let volume = self.store.insert_volume(validated, job_id)?;
        info!(volume_id = %volume.id, name = %volume.name, size_gb = volume.size_gb, "volume creation requested");
        let job = Job::create(ResourceKind::Volume, volume.id).with_id(job_id);
        self.dispatch(job, LifecycleState::Pending)?;
        Ok(Accepted {
            record: volume,
            job_id,
        })
    }

    pub fn get_volume(&self, id: Uuid) -> ServiceResult<Volume> {
        Ok(self.store.get_volume(id)?)
    }

    pub fn list_volumes(&self, query: &ListQuery) -> ServiceResult<Page<Volume>> {
        Ok(self.store.list_volumes(query, query.limit()?))
    }

    pub fn delete_volume(&self, id: Uuid) -> ServiceResult<Accepted<Volume>> {
        let job = Job::delete(ResourceKind::Volume, id);
        let volume = self.store.begin_volume_delete(id, job.id)?;
        info!(volume_id = %id, job_id = %job.id, "volume deletion requested");
        let job_id = self.dispatch(job, LifecycleState::Deleting)?;
        Ok(Accepted {
            record: volume,
            job_id,
        })
    }

    pub fn attach_volume(&self, volume_id: Uuid, vm_id: Uuid) -> ServiceResult<Volume> {
        let volume = self.store.attach_volume(volume_id, vm_id)?;
        info!(
            %volume_id,
            %vm_id,
            mount_path = volume.mount_path.as_deref().unwrap_or_default(),
            "volume attached"
        );
        Ok(volume)
    }

    pub fn detach_volume(&self, volume_id: Uuid) -> ServiceResult<Volume> {
        let volume = self.store.detach_volume(volume_id)?;
        info!(%volume_id, "volume detached");
        Ok(volume)
    }

    // Jobs

    pub fn get_job(&self, id: Uuid) -> ServiceResult<JobRecord> {
        self.ledger
            .get(id)
            .ok_or(ServiceError::not_found(ResourceKind::Job, id))
    }

    pub fn list_jobs(
        &self,
        resource_id: Option<Uuid>,
        query: &ListQuery,
    ) -> ServiceResult<Page<JobRecord>> {
        Ok(self.ledger.list(resource_id, query.skip(), query.limit()?))
    }

    /// Re-dispatch jobs for records left in `pending` or `deleting`, as found
    /// after a journal replay. Each job keeps the id the record is bound to.
    /// Returns the number of jobs submitted.
    pub fn resume_in_flight(&self) -> ServiceResult<usize> {
        let mut resumed = 0usize;
        for record in self.store.in_flight() {
            let mut job = match record.state {
                LifecycleState::Pending => Job::create(record.resource, record.id),
                _ => Job::delete(record.resource, record.id),
            };
            if let Some(job_id) = record.job_id {
                job = job.with_id(job_id);
            }
            self.dispatch(job, record.state)?;
            resumed += 1;
        }
        if resumed > 0 {
            info!(resumed, "re-dispatched in-flight lifecycle jobs");
        }
        Ok(resumed)
    }

    /// Submit `job`; on failure the record leaves `source` for `error`.
    fn dispatch(&self, job: Job, source: LifecycleState) -> ServiceResult<Uuid> {
        let resource = job.resource;
        let id = job.resource_id;
        let job_id = job.id;
        match self.dispatcher.submit(job) {
            Ok(handle) => Ok(handle.job_id),
            Err(err) => {
                let message = format!("lifecycle job could not be dispatched: {err}");
                self.mark_undispatched(resource, id, job_id, source, &message, &err);
                Err(ServiceError::Unavailable {
                    kind: resource,
                    id,
                    message,
                })
            }
        }
    }

    fn mark_undispatched(
        &self,
        resource: ResourceKind,
        id: Uuid,
        job_id: Uuid,
        source: LifecycleState,
        message: &str,
        cause: &DispatchError,
    ) {
        warn!(%resource, %id, %job_id, error = %cause, "dispatch failed; marking record as error");
        let change = StateChange::to(LifecycleState::Error)
            .expecting(source)
            .for_job(job_id)
            .with_error(message);
        let result = match resource {
            ResourceKind::Vm => self.store.update_vm_state(id, change).map(|_| ()),
            ResourceKind::Volume => self.store.update_volume_state(id, change).map(|_| ()),
            _ => Ok(()),
        };
        if let Err(err) = result {
            error!(%resource, %id, error = %err, "failed to record dispatch failure");
        }
    }
}
