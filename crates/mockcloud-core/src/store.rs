//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-memory resource tables with journaled mutations."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Resource tables for Environments, Security Groups, VMs and Volumes.
//!
//! All tables sit behind one lock so that checks spanning several records
//! (name uniqueness, attachment, address collisions) happen atomically with
//! the write they guard. Every mutation is appended to the journal when one
//! is configured.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::Utc;
use indexmap::IndexMap;
use mockcloud_persistence::Result as PersistenceResult;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::cidr::{AllocationError, Ipv4Network};
use crate::error::StoreError;
use crate::journal::{JournalBridge, JournalEvent, JournalOp};
use crate::model::{
    CreateSecurityGroup, CreateVm, CreateVolume, Environment, LifecycleRecord, LifecycleState,
    ListQuery, Page, ResourceKind, SecurityGroup, ValidEnvironment, Vm, Volume,
};

/// First and last device letters handed out to attached volumes.
const DEVICE_SLOTS: std::ops::RangeInclusive<char> = 'b'..='z';

/// Result of a state change guarded by an expected current state.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition<T> {
    Applied(T),
    /// The record was no longer in the expected state; nothing was written.
    Unchanged(T),
}

impl<T> Transition<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }

    pub fn record(&self) -> &T {
        match self {
            Transition::Applied(record) | Transition::Unchanged(record) => record,
        }
    }

    pub fn into_record(self) -> T {
        match self {
            Transition::Applied(record) | Transition::Unchanged(record) => record,
        }
    }
}

/// Requested lifecycle change for a VM or Volume.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub to: LifecycleState,
    /// When set, the change only applies if the record is still in this state.
    pub expected: Option<LifecycleState>,
    /// When set, the change only applies if this job still owns the record.
    pub job_id: Option<Uuid>,
    /// Job that takes ownership of the record once the change applies.
    pub rebind: Option<Uuid>,
    pub error_message: Option<String>,
}

impl StateChange {
    pub fn to(to: LifecycleState) -> Self {
        Self {
            to,
            expected: None,
            job_id: None,
            rebind: None,
            error_message: None,
        }
    }

    pub fn expecting(mut self, expected: LifecycleState) -> Self {
        self.expected = Some(expected);
        self
    }

    pub fn for_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn rebinding(mut self, job_id: Uuid) -> Self {
        self.rebind = Some(job_id);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// A VM or Volume waiting on a lifecycle job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    pub resource: ResourceKind,
    pub id: Uuid,
    pub state: LifecycleState,
    pub job_id: Option<Uuid>,
}

#[derive(Debug, Default)]
struct Tables {
    environments: IndexMap<Uuid, Environment>,
    security_groups: IndexMap<Uuid, SecurityGroup>,
    vms: IndexMap<Uuid, Vm>,
    volumes: IndexMap<Uuid, Volume>,
}

/// Shared, thread-safe store of every resource record.
#[derive(Debug, Default)]
pub struct ResourceStore {
    tables: RwLock<Tables>,
    journal: Option<Arc<JournalBridge>>,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that appends every mutation to `journal`.
    pub fn with_journal(journal: Arc<JournalBridge>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            journal: Some(journal),
        }
    }

    pub fn journal(&self) -> Option<&Arc<JournalBridge>> {
        self.journal.as_ref()
    }

    /// Journal appends that failed; zero without a journal.
    pub fn journal_failures(&self) -> u64 {
        self.journal
            .as_ref()
            .map_or(0, |journal| journal.failed_appends())
    }

    fn journal_upsert<T: Serialize>(&self, resource: ResourceKind, id: Uuid, record: &T) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.record_upsert(resource, id, record) {
                error!(
                    %resource,
                    %id,
                    error = %err,
                    failed_appends = journal.failed_appends(),
                    "journal append failed; change kept in memory only"
                );
            }
        }
    }

    fn journal_remove(&self, resource: ResourceKind, id: Uuid) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.record_remove(resource, id) {
                error!(
                    %resource,
                    %id,
                    error = %err,
                    failed_appends = journal.failed_appends(),
                    "journal append failed; change kept in memory only"
                );
            }
        }
    }

    // Environments

    pub fn create_environment(&self, request: ValidEnvironment) -> Result<Environment, StoreError> {
        let mut tables = self.tables.write();
        if tables.environments.values().any(|env| env.name == request.name) {
            return Err(StoreError::NameTaken {
                kind: ResourceKind::Environment,
                name: request.name,
            });
        }
        let environment = Environment {
            id: Uuid::new_v4(),
            name: request.name,
            network_cidr: request.network_cidr,
            description: request.description,
            created_at: Utc::now(),
        };
        tables
            .environments
            .insert(environment.id, environment.clone());
        self.journal_upsert(ResourceKind::Environment, environment.id, &environment);
        Ok(environment)
    }

    pub fn get_environment(&self, id: Uuid) -> Result<Environment, StoreError> {
        self.tables
            .read()
            .environments
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: ResourceKind::Environment,
                id,
            })
    }

    pub fn list_environments(&self, skip: usize, limit: usize) -> Page<Environment> {
        paginate(self.tables.read().environments.values(), skip, limit)
    }

    /// Remove an Environment. Records that reference it are left in place.
    pub fn delete_environment(&self, id: Uuid) -> Result<Environment, StoreError> {
        let mut tables = self.tables.write();
        let removed = tables
            .environments
            .shift_remove(&id)
            .ok_or(StoreError::NotFound {
                kind: ResourceKind::Environment,
                id,
            })?;
        self.journal_remove(ResourceKind::Environment, id);
        Ok(removed)
    }

    // Security groups

    pub fn create_security_group(
        &self,
        request: CreateSecurityGroup,
    ) -> Result<SecurityGroup, StoreError> {
        let mut tables = self.tables.write();
        if !tables.environments.contains_key(&request.environment_id) {
            return Err(StoreError::NotFound {
                kind: ResourceKind::Environment,
                id: request.environment_id,
            });
        }
        if tables.security_groups.values().any(|sg| sg.name == request.name) {
            return Err(StoreError::NameTaken {
                kind: ResourceKind::SecurityGroup,
                name: request.name,
            });
        }
        let group = SecurityGroup {
            id: Uuid::new_v4(),
            name: request.name,
            environment_id: request.environment_id,
            description: request.description,
            rules: request.rules,
            created_at: Utc::now(),
        };
        tables.security_groups.insert(group.id, group.clone());
        self.journal_upsert(ResourceKind::SecurityGroup, group.id, &group);
        Ok(group)
    }

    pub fn get_security_group(&self, id: Uuid) -> Result<SecurityGroup, StoreError> {
        self.tables
            .read()
            .security_groups
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: ResourceKind::SecurityGroup,
                id,
            })
    }

    pub fn list_security_groups(&self, query: &ListQuery, limit: usize) -> Page<SecurityGroup> {
        let tables = self.tables.read();
        let matches = tables.security_groups.values().filter(|sg| {
            query
                .environment_id
                .map_or(true, |env| sg.environment_id == env)
        });
        paginate(matches, query.skip(), limit)
    }

    /// Remove a Security Group that no live VM references.
    pub fn delete_security_group(&self, id: Uuid) -> Result<SecurityGroup, StoreError> {
        let mut tables = self.tables.write();
        if !tables.security_groups.contains_key(&id) {
            return Err(StoreError::NotFound {
                kind: ResourceKind::SecurityGroup,
                id,
            });
        }
        let users: Vec<Uuid> = tables
            .vms
            .values()
            .filter(|vm| vm.security_group_id == Some(id) && vm.state != LifecycleState::Deleted)
            .map(|vm| vm.id)
            .collect();
        if !users.is_empty() {
            return Err(StoreError::InvalidState {
                kind: ResourceKind::SecurityGroup,
                id,
                message: format!(
                    "SecurityGroup {id} is still used by {} VM(s)",
                    users.len()
                ),
            });
        }
        let removed = tables
            .security_groups
            .shift_remove(&id)
            .ok_or(StoreError::NotFound {
                kind: ResourceKind::SecurityGroup,
                id,
            })?;
        self.journal_remove(ResourceKind::SecurityGroup, id);
        Ok(removed)
    }

    // Virtual machines

    /// Insert a `pending` VM owned by `job_id` after checking its references.
    pub fn insert_vm(&self, request: CreateVm, job_id: Uuid) -> Result<Vm, StoreError> {
        let mut tables = self.tables.write();
        if !tables.environments.contains_key(&request.environment_id) {
            return Err(StoreError::NotFound {
                kind: ResourceKind::Environment,
                id: request.environment_id,
            });
        }
        if let Some(group_id) = request.security_group_id {
            let group = tables
                .security_groups
                .get(&group_id)
                .ok_or(StoreError::NotFound {
                    kind: ResourceKind::SecurityGroup,
                    id: group_id,
                })?;
            if group.environment_id != request.environment_id {
                return Err(StoreError::Rejected {
                    message: format!(
                        "SecurityGroup {group_id} belongs to Environment {}, not {}",
                        group.environment_id, request.environment_id
                    ),
                });
            }
        }
        if tables
            .vms
            .values()
            .any(|vm| vm.name == request.name && vm.state != LifecycleState::Deleted)
        {
            return Err(StoreError::NameTaken {
                kind: ResourceKind::Vm,
                name: request.name,
            });
        }
        let now = Utc::now();
        let vm = Vm {
            id: Uuid::new_v4(),
            name: request.name,
            instance_type: request.instance_type,
            environment_id: request.environment_id,
            security_group_id: request.security_group_id,
            state: LifecycleState::Pending,
            ip_address: None,
            error_message: None,
            lifecycle_job_id: Some(job_id),
            created_at: now,
            updated_at: now,
        };
        tables.vms.insert(vm.id, vm.clone());
        self.journal_upsert(ResourceKind::Vm, vm.id, &vm);
        Ok(vm)
    }

    pub fn get_vm(&self, id: Uuid) -> Result<Vm, StoreError> {
        self.tables
            .read()
            .vms
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: ResourceKind::Vm,
                id,
            })
    }

    pub fn list_vms(&self, query: &ListQuery, limit: usize) -> Page<Vm> {
        let tables = self.tables.read();
        let matches = tables.vms.values().filter(|vm| {
            query
                .environment_id
                .map_or(true, |env| vm.environment_id == env)
                && query.state.map_or(true, |state| vm.state == state)
        });
        paginate(matches, query.skip(), limit)
    }

    pub fn update_vm_state(&self, id: Uuid, change: StateChange) -> Result<Transition<Vm>, StoreError> {
        let mut tables = self.tables.write();
        let outcome = transition(&mut tables.vms, id, change)?;
        if let Transition::Applied(vm) = &outcome {
            self.journal_upsert(ResourceKind::Vm, vm.id, vm);
        }
        Ok(outcome)
    }

    /// Finish a VM delete. Only a VM still in `deleting` under `job_id` is touched.
    pub fn soft_delete_vm(&self, id: Uuid, job_id: Uuid) -> Result<Transition<Vm>, StoreError> {
        self.update_vm_state(
            id,
            StateChange::to(LifecycleState::Deleted)
                .expecting(LifecycleState::Deleting)
                .for_job(job_id),
        )
    }

    /// Move a `pending` VM owned by `job_id` to `active` with an address from
    /// its Environment.
    ///
    /// `allocate` receives the Environment network and the addresses already
    /// held by other VMs in it. An allocation failure, or an Environment that
    /// no longer exists, moves the VM to `error` instead.
    pub fn activate_vm<F>(
        &self,
        id: Uuid,
        job_id: Uuid,
        allocate: F,
    ) -> Result<Transition<Vm>, StoreError>
    where
        F: FnOnce(&Ipv4Network, &HashSet<Ipv4Addr>) -> Result<Ipv4Addr, AllocationError>,
    {
        let mut tables = self.tables.write();
        let Tables {
            environments, vms, ..
        } = &mut *tables;

        let current = vms.get(&id).ok_or(StoreError::NotFound {
            kind: ResourceKind::Vm,
            id,
        })?;
        if current.state != LifecycleState::Pending || !owned_by(current, job_id) {
            return Ok(Transition::Unchanged(current.clone()));
        }
        let environment_id = current.environment_id;

        let address = match environments.get(&environment_id) {
            Some(environment) => {
                let taken: HashSet<Ipv4Addr> = vms
                    .values()
                    .filter(|vm| vm.environment_id == environment_id && vm.id != id)
                    .filter_map(|vm| vm.ip_address)
                    .collect();
                allocate(&environment.network_cidr, &taken).map_err(|err| err.to_string())
            }
            None => Err(format!("Environment {environment_id} no longer exists")),
        };

        let vm = vms.get_mut(&id).ok_or(StoreError::NotFound {
            kind: ResourceKind::Vm,
            id,
        })?;
        let now = Utc::now();
        match address {
            Ok(address) => {
                vm.enter(LifecycleState::Active, None, now);
                vm.ip_address = Some(address);
            }
            Err(message) => vm.enter(LifecycleState::Error, Some(message), now),
        }
        let vm = vm.clone();
        self.journal_upsert(ResourceKind::Vm, vm.id, &vm);
        Ok(Transition::Applied(vm))
    }

    /// Move an `active` or `error` VM without attached volumes to `deleting`,
    /// handing it to `job_id`.
    pub fn begin_vm_delete(&self, id: Uuid, job_id: Uuid) -> Result<Vm, StoreError> {
        let mut tables = self.tables.write();
        let vm = tables.vms.get(&id).ok_or(StoreError::NotFound {
            kind: ResourceKind::Vm,
            id,
        })?;
        if !vm.state.accepts_delete() {
            return Err(StoreError::InvalidState {
                kind: ResourceKind::Vm,
                id,
                message: format!("VM {id} is {} and cannot be deleted", vm.state),
            });
        }
        let attached = tables
            .volumes
            .values()
            .filter(|volume| volume.attached_vm_id == Some(id))
            .count();
        if attached > 0 {
            return Err(StoreError::InvalidState {
                kind: ResourceKind::Vm,
                id,
                message: format!("VM {id} still has {attached} volume(s) attached"),
            });
        }
        let outcome = transition(
            &mut tables.vms,
            id,
            StateChange::to(LifecycleState::Deleting).rebinding(job_id),
        )?;
        let vm = outcome.into_record();
        self.journal_upsert(ResourceKind::Vm, vm.id, &vm);
        Ok(vm)
    }

    // Volumes

    pub fn insert_volume(&self, request: CreateVolume, job_id: Uuid) -> Result<Volume, StoreError> {
        let mut tables = self.tables.write();
        if !tables.environments.contains_key(&request.environment_id) {
            return Err(StoreError::NotFound {
                kind: ResourceKind::Environment,
                id: request.environment_id,
            });
        }
        if tables
            .volumes
            .values()
            .any(|volume| volume.name == request.name && volume.state != LifecycleState::Deleted)
        {
            return Err(StoreError::NameTaken {
                kind: ResourceKind::Volume,
                name: request.name,
            });
        }
        let now = Utc::now();
        let volume = Volume {
            id: Uuid::new_v4(),
            name: request.name,
            size_gb: request.size_gb,
            environment_id: request.environment_id,
            state: LifecycleState::Pending,
            attached_vm_id: None,
            mount_path: None,
            error_message: None,
            lifecycle_job_id: Some(job_id),
            created_at: now,
            updated_at: now,
        };
        tables.volumes.insert(volume.id, volume.clone());
        self.journal_upsert(ResourceKind::Volume, volume.id, &volume);
        Ok(volume)
    }

    pub fn get_volume(&self, id: Uuid) -> Result<Volume, StoreError> {
        self.tables
            .read()
            .volumes
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: ResourceKind::Volume,
                id,
            })
    }

    pub fn list_volumes(&self, query: &ListQuery, limit: usize) -> Page<Volume> {
        let tables = self.tables.read();
        let matches = tables.volumes.values().filter(|volume| {
            query
                .environment_id
                .map_or(true, |env| volume.environment_id == env)
                && query.state.map_or(true, |state| volume.state == state)
        });
        paginate(matches, query.skip(), limit)
    }

    pub fn update_volume_state(
        &self,
        id: Uuid,
        change: StateChange,
    ) -> Result<Transition<Volume>, StoreError> {
        let mut tables = self.tables.write();
        let outcome = transition(&mut tables.volumes, id, change)?;
        if let Transition::Applied(volume) = &outcome {
            self.journal_upsert(ResourceKind::Volume, volume.id, volume);
        }
        Ok(outcome)
    }

    /// Finish a Volume delete. Only a Volume still in `deleting` under `job_id` is touched.
    pub fn soft_delete_volume(
        &self,
        id: Uuid,
        job_id: Uuid,
    ) -> Result<Transition<Volume>, StoreError> {
        self.update_volume_state(
            id,
            StateChange::to(LifecycleState::Deleted)
                .expecting(LifecycleState::Deleting)
                .for_job(job_id),
        )
    }

    /// Move an `active` or `error` detached Volume to `deleting`, handing it
    /// to `job_id`.
    pub fn begin_volume_delete(&self, id: Uuid, job_id: Uuid) -> Result<Volume, StoreError> {
        let mut tables = self.tables.write();
        let volume = tables.volumes.get(&id).ok_or(StoreError::NotFound {
            kind: ResourceKind::Volume,
            id,
        })?;
        if !volume.state.accepts_delete() {
            return Err(StoreError::InvalidState {
                kind: ResourceKind::Volume,
                id,
                message: format!("Volume {id} is {} and cannot be deleted", volume.state),
            });
        }
        if let Some(vm_id) = volume.attached_vm_id {
            return Err(StoreError::InvalidState {
                kind: ResourceKind::Volume,
                id,
                message: format!("Volume {id} is still attached to VM {vm_id}"),
            });
        }
        let outcome = transition(
            &mut tables.volumes,
            id,
            StateChange::to(LifecycleState::Deleting).rebinding(job_id),
        )?;
        let volume = outcome.into_record();
        self.journal_upsert(ResourceKind::Volume, volume.id, &volume);
        Ok(volume)
    }

    /// Attach an active Volume to an active VM in the same Environment.
    ///
    /// The device path is the first free slot on the VM, `/dev/vdb` onward.
    pub fn attach_volume(&self, volume_id: Uuid, vm_id: Uuid) -> Result<Volume, StoreError> {
        let mut tables = self.tables.write();
        let volume = tables.volumes.get(&volume_id).ok_or(StoreError::NotFound {
            kind: ResourceKind::Volume,
            id: volume_id,
        })?;
        let vm = tables.vms.get(&vm_id).ok_or(StoreError::NotFound {
            kind: ResourceKind::Vm,
            id: vm_id,
        })?;

        if volume.state != LifecycleState::Active {
            return Err(StoreError::InvalidState {
                kind: ResourceKind::Volume,
                id: volume_id,
                message: format!(
                    "Volume {volume_id} is {}; only active volumes can be attached",
                    volume.state
                ),
            });
        }
        if let Some(current) = volume.attached_vm_id {
            return Err(StoreError::InvalidState {
                kind: ResourceKind::Volume,
                id: volume_id,
                message: format!("Volume {volume_id} is already attached to VM {current}"),
            });
        }
        if vm.state != LifecycleState::Active {
            return Err(StoreError::InvalidState {
                kind: ResourceKind::Vm,
                id: vm_id,
                message: format!(
                    "VM {vm_id} is {}; volumes can only be attached to active VMs",
                    vm.state
                ),
            });
        }
        if vm.environment_id != volume.environment_id {
            return Err(StoreError::Rejected {
                message: format!(
                    "Volume {volume_id} and VM {vm_id} belong to different Environments"
                ),
            });
        }

        let used: HashSet<&str> = tables
            .volumes
            .values()
            .filter(|other| other.attached_vm_id == Some(vm_id))
            .filter_map(|other| other.mount_path.as_deref())
            .collect();
        let mount_path = DEVICE_SLOTS
            .map(|slot| format!("/dev/vd{slot}"))
            .find(|path| !used.contains(path.as_str()))
            .ok_or_else(|| StoreError::Conflict {
                kind: ResourceKind::Vm,
                id: vm_id,
                message: format!("VM {vm_id} has no free device slot left"),
            })?;

        let volume = tables
            .volumes
            .get_mut(&volume_id)
            .ok_or(StoreError::NotFound {
                kind: ResourceKind::Volume,
                id: volume_id,
            })?;
        volume.attached_vm_id = Some(vm_id);
        volume.mount_path = Some(mount_path);
        volume.updated_at = Utc::now();
        let volume = volume.clone();
        debug!(volume_id = %volume.id, %vm_id, mount_path = ?volume.mount_path, "volume attached");
        self.journal_upsert(ResourceKind::Volume, volume.id, &volume);
        Ok(volume)
    }

    pub fn detach_volume(&self, volume_id: Uuid) -> Result<Volume, StoreError> {
        let mut tables = self.tables.write();
        let volume = tables
            .volumes
            .get_mut(&volume_id)
            .ok_or(StoreError::NotFound {
                kind: ResourceKind::Volume,
                id: volume_id,
            })?;
        if volume.attached_vm_id.is_none() {
            return Err(StoreError::InvalidState {
                kind: ResourceKind::Volume,
                id: volume_id,
                message: format!("Volume {volume_id} is not attached"),
            });
        }
        volume.attached_vm_id = None;
        volume.mount_path = None;
        volume.updated_at = Utc::now();
        let volume = volume.clone();
        self.journal_upsert(ResourceKind::Volume, volume.id, &volume);
        Ok(volume)
    }

    /// VMs and Volumes sitting in `pending` or `deleting`, in insertion order.
    pub fn in_flight(&self) -> Vec<InFlight> {
        let tables = self.tables.read();
        let vms = tables.vms.values().map(|vm| InFlight {
            resource: ResourceKind::Vm,
            id: vm.id,
            state: vm.state,
            job_id: vm.lifecycle_job_id,
        });
        let volumes = tables.volumes.values().map(|volume| InFlight {
            resource: ResourceKind::Volume,
            id: volume.id,
            state: volume.state,
            job_id: volume.lifecycle_job_id,
        });
        vms.chain(volumes)
            .filter(|record| record.state.is_transient())
            .collect()
    }

    /// Rebuild the tables from the journal without re-journaling.
    pub fn restore_from_journal(&self) -> PersistenceResult<usize> {
        let Some(journal) = &self.journal else {
            return Ok(0);
        };
        journal.replay(|event| self.apply_event(event))
    }

    fn apply_event(&self, event: JournalEvent) -> PersistenceResult<()> {
        let mut tables = self.tables.write();
        match event.op {
            JournalOp::Remove => match event.resource {
                ResourceKind::Environment => {
                    tables.environments.shift_remove(&event.id);
                }
                ResourceKind::SecurityGroup => {
                    tables.security_groups.shift_remove(&event.id);
                }
                ResourceKind::Vm => {
                    tables.vms.shift_remove(&event.id);
                }
                ResourceKind::Volume => {
                    tables.volumes.shift_remove(&event.id);
                }
                ResourceKind::Job => {}
            },
            JournalOp::Upsert => {
                let Some(record) = event.record else {
                    warn!(resource = %event.resource, id = %event.id, "journal upsert without record");
                    return Ok(());
                };
                match event.resource {
                    ResourceKind::Environment => {
                        upsert(&mut tables.environments, event.id, record)?
                    }
                    ResourceKind::SecurityGroup => {
                        upsert(&mut tables.security_groups, event.id, record)?
                    }
                    ResourceKind::Vm => upsert(&mut tables.vms, event.id, record)?,
                    ResourceKind::Volume => upsert(&mut tables.volumes, event.id, record)?,
                    ResourceKind::Job => {}
                }
            }
        }
        Ok(())
    }
}

fn upsert<T: DeserializeOwned>(
    table: &mut IndexMap<Uuid, T>,
    id: Uuid,
    record: serde_json::Value,
) -> PersistenceResult<()> {
    let record: T = serde_json::from_value(record)?;
    table.insert(id, record);
    Ok(())
}

fn transition<R: LifecycleRecord>(
    table: &mut IndexMap<Uuid, R>,
    id: Uuid,
    change: StateChange,
) -> Result<Transition<R>, StoreError> {
    let record = table.get_mut(&id).ok_or(StoreError::NotFound { kind: R::KIND, id })?;
    let from = record.state();
    if change.expected.is_some_and(|expected| expected != from) {
        return Ok(Transition::Unchanged(record.clone()));
    }
    if change.job_id.is_some_and(|job_id| !owned_by(&*record, job_id)) {
        return Ok(Transition::Unchanged(record.clone()));
    }
    if !from.can_transition_to(change.to) {
        return Err(StoreError::InvalidTransition {
            kind: R::KIND,
            id,
            from,
            to: change.to,
        });
    }
    if let Some(job_id) = change.rebind {
        record.bind_job(job_id);
    }
    record.enter(change.to, change.error_message, Utc::now());
    Ok(Transition::Applied(record.clone()))
}

/// Records written before job ownership was tracked accept any job.
fn owned_by<R: LifecycleRecord>(record: &R, job_id: Uuid) -> bool {
    record
        .lifecycle_job_id()
        .map_or(true, |owner| owner == job_id)
}

fn paginate<'a, T, I>(records: I, skip: usize, limit: usize) -> Page<T>
where
    T: Clone + 'a,
    I: Iterator<Item = &'a T>,
{
    let mut total = 0usize;
    let mut items = Vec::new();
    for record in records {
        if total >= skip && items.len() < limit {
            items.push(record.clone());
        }
        total += 1;
    }
    Page { items, total }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CreateEnvironment;
    use tempfile::tempdir;

    fn environment(store: &ResourceStore, name: &str, cidr: &str) -> Environment {
        let request = CreateEnvironment {
            name: name.into(),
            network_cidr: cidr.into(),
            description: None,
        }
        .validate()
        .unwrap();
        store.create_environment(request).unwrap()
    }

    fn vm_request(env: &Environment, name: &str) -> CreateVm {
        CreateVm {
            name: name.into(),
            instance_type: "t3.micro".into(),
            environment_id: env.id,
            security_group_id: None,
        }
    }

    fn vm(store: &ResourceStore, env: &Environment, name: &str) -> Vm {
        store
            .insert_vm(vm_request(env, name), Uuid::new_v4())
            .unwrap()
    }

    fn volume(store: &ResourceStore, env: &Environment, name: &str) -> Volume {
        let request = CreateVolume {
            name: name.into(),
            size_gb: 10,
            environment_id: env.id,
        };
        store.insert_volume(request, Uuid::new_v4()).unwrap()
    }

    fn job<R: LifecycleRecord>(record: &R) -> Uuid {
        record.lifecycle_job_id().unwrap()
    }

    fn activate_volume(store: &ResourceStore, id: Uuid) {
        store
            .update_volume_state(id, StateChange::to(LifecycleState::Active))
            .unwrap();
    }

    fn fixed(
        address: Ipv4Addr,
    ) -> impl FnOnce(&Ipv4Network, &HashSet<Ipv4Addr>) -> Result<Ipv4Addr, AllocationError> {
        move |_: &Ipv4Network, _: &HashSet<Ipv4Addr>| Ok(address)
    }

    #[test]
    fn environment_names_are_unique() {
        let store = ResourceStore::new();
        environment(&store, "prod", "10.0.0.0/16");
        let request = CreateEnvironment {
            name: "prod".into(),
            network_cidr: "10.1.0.0/16".into(),
            description: None,
        }
        .validate()
        .unwrap();
        assert!(matches!(
            store.create_environment(request),
            Err(StoreError::NameTaken { .. })
        ));
    }

    #[test]
    fn vm_names_free_up_after_deletion() {
        let store = ResourceStore::new();
        let env = environment(&store, "prod", "10.0.0.0/16");
        let first = vm(&store, &env, "web1");
        assert!(matches!(
            store.insert_vm(vm_request(&env, "web1"), Uuid::new_v4()),
            Err(StoreError::NameTaken { .. })
        ));

        store
            .activate_vm(first.id, job(&first), fixed(Ipv4Addr::new(10, 0, 0, 5)))
            .unwrap();
        let delete_job = Uuid::new_v4();
        store.begin_vm_delete(first.id, delete_job).unwrap();
        store.soft_delete_vm(first.id, delete_job).unwrap();
        vm(&store, &env, "web1");
    }

    #[test]
    fn transitions_outside_the_lifecycle_are_rejected() {
        let store = ResourceStore::new();
        let env = environment(&store, "prod", "10.0.0.0/16");
        let record = vm(&store, &env, "web1");
        let err = store
            .update_vm_state(record.id, StateChange::to(LifecycleState::Deleted))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: LifecycleState::Pending,
                to: LifecycleState::Deleted,
                ..
            }
        ));
    }

    #[test]
    fn guarded_change_is_a_noop_once_state_moved_on() {
        let store = ResourceStore::new();
        let env = environment(&store, "prod", "10.0.0.0/16");
        let record = vm(&store, &env, "web1");
        let first = store
            .activate_vm(record.id, job(&record), fixed(Ipv4Addr::new(10, 0, 0, 7)))
            .unwrap();
        assert!(first.is_applied());

        let again = store
            .update_vm_state(
                record.id,
                StateChange::to(LifecycleState::Error)
                    .expecting(LifecycleState::Pending)
                    .with_error("late failure"),
            )
            .unwrap();
        assert!(!again.is_applied());
        assert_eq!(again.record(), first.record());
        assert_eq!(store.get_vm(record.id).unwrap(), first.into_record());
    }

    #[test]
    fn activation_sees_addresses_of_the_same_environment() {
        let store = ResourceStore::new();
        let env = environment(&store, "prod", "10.0.0.0/16");
        let other_env = environment(&store, "dev", "10.0.0.0/16");
        let a = vm(&store, &env, "a");
        let b = vm(&store, &env, "b");
        let c = vm(&store, &other_env, "c");

        store
            .activate_vm(a.id, job(&a), fixed(Ipv4Addr::new(10, 0, 0, 1)))
            .unwrap();
        store
            .activate_vm(c.id, job(&c), fixed(Ipv4Addr::new(10, 0, 0, 2)))
            .unwrap();
        store
            .activate_vm(b.id, job(&b), |network, taken| {
                assert_eq!(network.to_string(), "10.0.0.0/16");
                assert_eq!(taken.len(), 1);
                assert!(taken.contains(&Ipv4Addr::new(10, 0, 0, 1)));
                Ok(Ipv4Addr::new(10, 0, 0, 3))
            })
            .unwrap();
        assert_eq!(
            store.get_vm(b.id).unwrap().ip_address,
            Some(Ipv4Addr::new(10, 0, 0, 3))
        );
    }

    #[test]
    fn allocation_failure_moves_vm_to_error() {
        let store = ResourceStore::new();
        let env = environment(&store, "tiny", "10.9.0.0/30");
        let record = vm(&store, &env, "web1");
        let network = env.network_cidr;
        let outcome = store
            .activate_vm(record.id, job(&record), move |_, _| {
                Err(AllocationError::Exhausted { network })
            })
            .unwrap()
            .into_record();
        assert_eq!(outcome.state, LifecycleState::Error);
        assert_eq!(outcome.ip_address, None);
        assert!(outcome.error_message.unwrap().contains("10.9.0.0/30"));
    }

    #[test]
    fn attach_assigns_sequential_devices_and_detach_clears() {
        let store = ResourceStore::new();
        let env = environment(&store, "prod", "10.0.0.0/16");
        let host = vm(&store, &env, "db");
        store
            .activate_vm(host.id, job(&host), fixed(Ipv4Addr::new(10, 0, 0, 9)))
            .unwrap();
        let first = volume(&store, &env, "data-1");
        let second = volume(&store, &env, "data-2");
        activate_volume(&store, first.id);
        activate_volume(&store, second.id);

        let first = store.attach_volume(first.id, host.id).unwrap();
        let second = store.attach_volume(second.id, host.id).unwrap();
        assert_eq!(first.mount_path.as_deref(), Some("/dev/vdb"));
        assert_eq!(second.mount_path.as_deref(), Some("/dev/vdc"));

        let detached = store.detach_volume(first.id).unwrap();
        assert_eq!(detached.attached_vm_id, None);
        assert_eq!(detached.mount_path, None);
        assert!(matches!(
            store.detach_volume(first.id),
            Err(StoreError::InvalidState { .. })
        ));

        let again = store.attach_volume(first.id, host.id).unwrap();
        assert_eq!(again.mount_path.as_deref(), Some("/dev/vdb"));
    }

    #[test]
    fn attached_records_cannot_be_deleted() {
        let store = ResourceStore::new();
        let env = environment(&store, "prod", "10.0.0.0/16");
        let host = vm(&store, &env, "db");
        store
            .activate_vm(host.id, job(&host), fixed(Ipv4Addr::new(10, 0, 0, 9)))
            .unwrap();
        let disk = volume(&store, &env, "data");
        activate_volume(&store, disk.id);
        store.attach_volume(disk.id, host.id).unwrap();

        assert!(matches!(
            store.begin_vm_delete(host.id, Uuid::new_v4()),
            Err(StoreError::InvalidState { kind: ResourceKind::Vm, .. })
        ));
        assert!(matches!(
            store.begin_volume_delete(disk.id, Uuid::new_v4()),
            Err(StoreError::InvalidState { kind: ResourceKind::Volume, .. })
        ));
    }

    #[test]
    fn attach_rejects_cross_environment_pairs() {
        let store = ResourceStore::new();
        let prod = environment(&store, "prod", "10.0.0.0/16");
        let dev = environment(&store, "dev", "10.1.0.0/16");
        let host = vm(&store, &prod, "db");
        store
            .activate_vm(host.id, job(&host), fixed(Ipv4Addr::new(10, 0, 0, 9)))
            .unwrap();
        let disk = volume(&store, &dev, "data");
        activate_volume(&store, disk.id);
        assert!(matches!(
            store.attach_volume(disk.id, host.id),
            Err(StoreError::Rejected { .. })
        ));
    }

    #[test]
    fn list_filters_and_paginates() {
        let store = ResourceStore::new();
        let prod = environment(&store, "prod", "10.0.0.0/16");
        let dev = environment(&store, "dev", "10.1.0.0/16");
        for index in 0..5 {
            vm(&store, &prod, &format!("prod-{index}"));
        }
        vm(&store, &dev, "dev-0");

        let query = ListQuery {
            environment_id: Some(prod.id),
            skip: Some(1),
            ..ListQuery::default()
        };
        let page = store.list_vms(&query, 2);
        assert_eq!(page.total, 5);
        let names: Vec<_> = page.items.iter().map(|vm| vm.name.as_str()).collect();
        assert_eq!(names, vec!["prod-1", "prod-2"]);

        let active = ListQuery {
            state: Some(LifecycleState::Active),
            ..ListQuery::default()
        };
        assert_eq!(store.list_vms(&active, 100).total, 0);
    }

    #[test]
    fn in_use_security_group_cannot_be_deleted() {
        let store = ResourceStore::new();
        let env = environment(&store, "prod", "10.0.0.0/16");
        let group = store
            .create_security_group(CreateSecurityGroup {
                name: "web".into(),
                environment_id: env.id,
                description: None,
                rules: Vec::new(),
            })
            .unwrap();
        let request = CreateVm {
            security_group_id: Some(group.id),
            ..vm_request(&env, "web1")
        };
        store.insert_vm(request, Uuid::new_v4()).unwrap();
        assert!(matches!(
            store.delete_security_group(group.id),
            Err(StoreError::InvalidState { .. })
        ));
    }

    #[test]
    fn journal_restores_tables_and_in_flight_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.journal");
        let (env_id, pending, active_id) = {
            let journal = Arc::new(JournalBridge::open(path.clone(), None).unwrap());
            let store = ResourceStore::with_journal(journal);
            let env = environment(&store, "prod", "10.0.0.0/16");
            let pending = vm(&store, &env, "pending");
            let active = vm(&store, &env, "active");
            store
                .activate_vm(active.id, job(&active), fixed(Ipv4Addr::new(10, 0, 0, 4)))
                .unwrap();
            let gone = environment(&store, "gone", "10.2.0.0/16");
            store.delete_environment(gone.id).unwrap();
            (env.id, pending, active.id)
        };

        let journal = Arc::new(JournalBridge::open(path, None).unwrap());
        let store = ResourceStore::with_journal(journal);
        let replayed = store.restore_from_journal().unwrap();
        assert_eq!(replayed, 6);

        assert_eq!(store.list_environments(0, 100).total, 1);
        assert_eq!(store.get_environment(env_id).unwrap().name, "prod");
        let active = store.get_vm(active_id).unwrap();
        assert_eq!(active.state, LifecycleState::Active);
        assert_eq!(active.ip_address, Some(Ipv4Addr::new(10, 0, 0, 4)));
        assert_eq!(
            store.in_flight(),
            vec![InFlight {
                resource: ResourceKind::Vm,
                id: pending.id,
                state: LifecycleState::Pending,
                job_id: pending.lifecycle_job_id,
            }]
        );
    }

    #[test]
    fn stale_delete_job_cannot_finish_a_newer_delete() {
        let store = ResourceStore::new();
        let env = environment(&store, "prod", "10.0.0.0/16");
        let host = vm(&store, &env, "web1");
        store
            .activate_vm(host.id, job(&host), fixed(Ipv4Addr::new(10, 0, 0, 9)))
            .unwrap();

        let first = Uuid::new_v4();
        store.begin_vm_delete(host.id, first).unwrap();
        store
            .update_vm_state(
                host.id,
                StateChange::to(LifecycleState::Error)
                    .expecting(LifecycleState::Deleting)
                    .for_job(first)
                    .with_error("simulated failure"),
            )
            .unwrap();

        let second = Uuid::new_v4();
        let deleting = store.begin_vm_delete(host.id, second).unwrap();
        assert_eq!(deleting.lifecycle_job_id, Some(second));

        let stale = store.soft_delete_vm(host.id, first).unwrap();
        assert!(!stale.is_applied());
        assert_eq!(store.get_vm(host.id).unwrap().state, LifecycleState::Deleting);

        let current = store.soft_delete_vm(host.id, second).unwrap();
        assert!(current.is_applied());
        assert_eq!(current.record().state, LifecycleState::Deleted);
    }
}
