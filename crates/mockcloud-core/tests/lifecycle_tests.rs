//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Lifecycle convergence tests against the running control plane."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use mockcloud_common::config::{AppConfig, CatalogConfig, WorkerConfig};
use mockcloud_common::init_test_tracing;
use mockcloud_core::cidr::Ipv4Network;
use mockcloud_core::journal::JournalBridge;
use mockcloud_core::model::{CreateEnvironment, CreateVm, CreateVolume, Environment, ListQuery};
use mockcloud_core::store::StateChange;
use mockcloud_core::{
    ChannelDispatcher, ControlPlane, ControlPlaneHandle, Job, JobLedger, JobOutcome, JobStatus,
    LifecycleState, LifecycleWorker, ResourceService, ResourceStore, ServiceError, StoreError,
};
use tempfile::tempdir;
use tokio::sync::mpsc;
use uuid::Uuid;

fn worker_config(failure_probability: f64) -> WorkerConfig {
    WorkerConfig {
        failure_probability,
        seed: Some(42),
        ..WorkerConfig::default()
    }
}

async fn start(failure_probability: f64) -> ControlPlaneHandle {
    init_test_tracing();
    let config = AppConfig {
        worker: worker_config(failure_probability),
        ..AppConfig::default()
    };
    ControlPlane::new(config, None).start().await.unwrap()
}

/// Advance the paused clock until no VM or Volume waits on a job.
async fn settle(service: &ResourceService) {
    for _ in 0..1_000 {
        if service.store().in_flight().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
    panic!("resources did not settle");
}

fn environment(service: &ResourceService, name: &str, cidr: &str) -> Environment {
    service
        .create_environment(CreateEnvironment {
            name: name.into(),
            network_cidr: cidr.into(),
            description: None,
        })
        .unwrap()
}

fn vm_request(name: &str, environment_id: Uuid) -> CreateVm {
    CreateVm {
        name: name.into(),
        instance_type: "t3.micro".into(),
        environment_id,
        security_group_id: None,
    }
}

fn volume_request(name: &str, environment_id: Uuid) -> CreateVolume {
    CreateVolume {
        name: name.into(),
        size_gb: 50,
        environment_id,
    }
}

/// Components wired without a pool so tests can drive jobs by hand.
struct Manual {
    service: ResourceService,
    worker: LifecycleWorker,
    receiver: mpsc::UnboundedReceiver<Job>,
}

fn manual() -> Manual {
    let store = Arc::new(ResourceStore::new());
    let ledger = Arc::new(JobLedger::new());
    let (dispatcher, receiver) = ChannelDispatcher::new(ledger.clone(), None);
    let worker =
        LifecycleWorker::new(worker_config(0.0), store.clone(), ledger.clone(), None).unwrap();
    let service = ResourceService::new(
        store,
        Arc::new(dispatcher),
        ledger,
        CatalogConfig::default(),
    );
    Manual {
        service,
        worker,
        receiver,
    }
}

#[tokio::test(start_paused = true)]
async fn vm_in_prod_becomes_active_with_address_in_range() {
    let plane = start(0.0).await;
    let service = plane.service();
    let prod = environment(&service, "prod", "10.0.0.0/16");

    let accepted = service.create_vm(vm_request("web1", prod.id)).unwrap();
    assert_eq!(accepted.record.state, LifecycleState::Pending);
    assert_eq!(accepted.record.ip_address, None);

    tokio::time::sleep(Duration::from_secs(61)).await;

    let vm = service.get_vm(accepted.record.id).unwrap();
    assert_eq!(vm.state, LifecycleState::Active);
    let network: Ipv4Network = "10.0.0.0/16".parse().unwrap();
    assert!(network.contains_host(vm.ip_address.unwrap()));
    assert_eq!(
        service.get_job(accepted.job_id).unwrap().status,
        JobStatus::Succeeded
    );

    plane.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn thousand_creations_without_failures_all_become_active() {
    let plane = start(0.0).await;
    let service = plane.service();
    let prod = environment(&service, "prod", "10.0.0.0/16");

    for index in 0..1_000 {
        service
            .create_vm(vm_request(&format!("vm-{index}"), prod.id))
            .unwrap();
    }
    settle(&service).await;

    let query = ListQuery {
        limit: Some(1_000),
        ..ListQuery::default()
    };
    let page = service.list_vms(&query).unwrap();
    assert_eq!(page.total, 1_000);
    assert!(page.items.iter().all(|vm| vm.state == LifecycleState::Active));
    let addresses: HashSet<_> = page.items.iter().filter_map(|vm| vm.ip_address).collect();
    assert_eq!(addresses.len(), 1_000);

    plane.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn certain_failure_sends_every_creation_to_error() {
    let plane = start(1.0).await;
    let service = plane.service();
    let prod = environment(&service, "prod", "10.0.0.0/16");

    let mut ids = Vec::new();
    for index in 0..1_000 {
        ids.push(
            service
                .create_vm(vm_request(&format!("vm-{index}"), prod.id))
                .unwrap()
                .record
                .id,
        );
    }
    let volume = service
        .create_volume(volume_request("data", prod.id))
        .unwrap()
        .record;
    settle(&service).await;

    for id in ids {
        let vm = service.get_vm(id).unwrap();
        assert_eq!(vm.state, LifecycleState::Error);
        assert_eq!(vm.ip_address, None);
        assert!(vm.error_message.is_some());
    }
    assert_eq!(
        service.get_volume(volume.id).unwrap().state,
        LifecycleState::Error
    );

    plane.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn delete_runs_through_deleting_to_deleted() {
    let plane = start(0.0).await;
    let service = plane.service();
    let prod = environment(&service, "prod", "10.0.0.0/16");
    let vm = service.create_vm(vm_request("web1", prod.id)).unwrap().record;
    settle(&service).await;

    let accepted = service.delete_vm(vm.id).unwrap();
    assert_eq!(accepted.record.state, LifecycleState::Deleting);
    assert!(accepted.record.ip_address.is_some());
    assert!(matches!(
        service.delete_vm(vm.id),
        Err(ServiceError::InvalidState { .. })
    ));
    tokio::time::sleep(Duration::from_secs(6)).await;

    let deleted = service.get_vm(vm.id).unwrap();
    assert_eq!(deleted.state, LifecycleState::Deleted);
    assert_eq!(deleted.ip_address, None);
    assert!(matches!(
        service.delete_vm(vm.id),
        Err(ServiceError::InvalidState { .. })
    ));
    assert!(matches!(
        service
            .store()
            .update_vm_state(vm.id, StateChange::to(LifecycleState::Active)),
        Err(StoreError::InvalidTransition {
            from: LifecycleState::Deleted,
            to: LifecycleState::Active,
            ..
        })
    ));

    plane.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn two_volumes_attach_to_one_vm() {
    let plane = start(0.0).await;
    let service = plane.service();
    let prod = environment(&service, "prod", "10.0.0.0/16");
    let vm = service.create_vm(vm_request("db", prod.id)).unwrap().record;
    let first = service
        .create_volume(volume_request("data-1", prod.id))
        .unwrap()
        .record;
    let second = service
        .create_volume(volume_request("data-2", prod.id))
        .unwrap()
        .record;

    assert!(matches!(
        service.attach_volume(first.id, vm.id),
        Err(ServiceError::InvalidState { .. })
    ));
    settle(&service).await;

    let first = service.attach_volume(first.id, vm.id).unwrap();
    let second = service.attach_volume(second.id, vm.id).unwrap();
    assert_eq!(first.attached_vm_id, Some(vm.id));
    assert_eq!(second.attached_vm_id, Some(vm.id));
    assert_ne!(first.mount_path, second.mount_path);

    assert!(matches!(
        service.delete_vm(vm.id),
        Err(ServiceError::InvalidState { .. })
    ));
    let detached = service.detach_volume(first.id).unwrap();
    assert_eq!(detached.attached_vm_id, None);
    assert_eq!(detached.mount_path, None);

    plane.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn deleting_a_pending_vm_is_rejected() {
    let plane = start(0.0).await;
    let service = plane.service();
    let prod = environment(&service, "prod", "10.0.0.0/16");
    let vm = service.create_vm(vm_request("web1", prod.id)).unwrap().record;

    let err = service.delete_vm(vm.id).unwrap_err();
    assert!(matches!(err, ServiceError::InvalidState { .. }));
    assert_eq!(service.get_vm(vm.id).unwrap().state, LifecycleState::Pending);

    plane.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn exhausted_network_fails_the_extra_vm() {
    let plane = start(0.0).await;
    let service = plane.service();
    let tiny = environment(&service, "tiny", "192.168.10.0/30");
    for name in ["a", "b", "c"] {
        service.create_vm(vm_request(name, tiny.id)).unwrap();
    }
    settle(&service).await;

    let page = service.list_vms(&ListQuery::default()).unwrap();
    let active = page
        .items
        .iter()
        .filter(|vm| vm.state == LifecycleState::Active)
        .count();
    let failed: Vec<_> = page
        .items
        .iter()
        .filter(|vm| vm.state == LifecycleState::Error)
        .collect();
    assert_eq!(active, 2);
    assert_eq!(failed.len(), 1);
    assert!(failed[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("192.168.10.0/30"));

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn redelivered_jobs_leave_terminal_records_unchanged() {
    let mut manual = manual();
    let prod = environment(&manual.service, "prod", "10.0.0.0/16");
    let vm = manual
        .service
        .create_vm(vm_request("web1", prod.id))
        .unwrap()
        .record;

    let job = manual.receiver.recv().await.unwrap();
    assert_eq!(
        manual.worker.complete(&job, false).unwrap(),
        JobOutcome::Succeeded
    );
    let active = manual.service.get_vm(vm.id).unwrap();
    assert_eq!(active.state, LifecycleState::Active);

    for failed in [false, true] {
        let outcome = manual.worker.complete(&job.redelivered(), failed).unwrap();
        assert!(matches!(outcome, JobOutcome::Skipped(_)));
        assert_eq!(manual.service.get_vm(vm.id).unwrap(), active);
    }
}

#[tokio::test]
async fn failed_delete_keeps_address_and_allows_retry() {
    let mut manual = manual();
    let prod = environment(&manual.service, "prod", "10.0.0.0/16");
    let vm = manual
        .service
        .create_vm(vm_request("web1", prod.id))
        .unwrap()
        .record;
    let create = manual.receiver.recv().await.unwrap();
    manual.worker.complete(&create, false).unwrap();
    let address = manual.service.get_vm(vm.id).unwrap().ip_address;
    assert!(address.is_some());

    manual.service.delete_vm(vm.id).unwrap();
    let delete = manual.receiver.recv().await.unwrap();
    let outcome = manual.worker.complete(&delete, true).unwrap();
    assert!(matches!(outcome, JobOutcome::Failed(_)));
    let failed = manual.service.get_vm(vm.id).unwrap();
    assert_eq!(failed.state, LifecycleState::Error);
    assert_eq!(failed.ip_address, address);

    manual.service.delete_vm(vm.id).unwrap();
    let retry = manual.receiver.recv().await.unwrap();
    assert_eq!(
        manual.worker.complete(&retry, false).unwrap(),
        JobOutcome::Succeeded
    );
    assert_eq!(
        manual.service.get_vm(vm.id).unwrap().state,
        LifecycleState::Deleted
    );
}

#[tokio::test]
async fn stale_delete_delivery_is_skipped_after_a_new_delete() {
    let mut manual = manual();
    let prod = environment(&manual.service, "prod", "10.0.0.0/16");
    let vm = manual
        .service
        .create_vm(vm_request("web1", prod.id))
        .unwrap()
        .record;
    let create = manual.receiver.recv().await.unwrap();
    manual.worker.complete(&create, false).unwrap();

    manual.service.delete_vm(vm.id).unwrap();
    let first = manual.receiver.recv().await.unwrap();
    assert!(matches!(
        manual.worker.complete(&first, true).unwrap(),
        JobOutcome::Failed(_)
    ));

    let accepted = manual.service.delete_vm(vm.id).unwrap();
    let second = manual.receiver.recv().await.unwrap();
    assert_eq!(second.id, accepted.job_id);
    assert_ne!(second.id, first.id);

    let stale = manual.worker.complete(&first.redelivered(), false).unwrap();
    assert!(matches!(stale, JobOutcome::Skipped(_)), "{stale:?}");
    let current = manual.service.get_vm(vm.id).unwrap();
    assert_eq!(current.state, LifecycleState::Deleting);
    assert_eq!(current.lifecycle_job_id, Some(second.id));

    assert_eq!(
        manual.worker.complete(&second, false).unwrap(),
        JobOutcome::Succeeded
    );
    assert_eq!(
        manual.service.get_vm(vm.id).unwrap().state,
        LifecycleState::Deleted
    );
}

#[tokio::test(start_paused = true)]
async fn journal_replay_resumes_pending_records() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.journal");
    let (env_id, vm_id) = {
        let journal = Arc::new(JournalBridge::open(path.clone(), None).unwrap());
        let store = ResourceStore::with_journal(journal);
        let env = store
            .create_environment(
                CreateEnvironment {
                    name: "prod".into(),
                    network_cidr: "10.0.0.0/16".into(),
                    description: None,
                }
                .validate()
                .unwrap(),
            )
            .unwrap();
        let vm = store
            .insert_vm(vm_request("web1", env.id), Uuid::new_v4())
            .unwrap();
        (env.id, vm.id)
    };

    let mut config = AppConfig {
        worker: worker_config(0.0),
        ..AppConfig::default()
    };
    config.storage.journal_path = Some(path);
    config.storage.replay_on_start = true;
    let plane = ControlPlane::new(config, None).start().await.unwrap();
    let service = plane.service();

    assert_eq!(service.get_environment(env_id).unwrap().name, "prod");
    assert_eq!(service.get_vm(vm_id).unwrap().state, LifecycleState::Pending);
    assert_eq!(service.list_jobs(Some(vm_id), &ListQuery::default()).unwrap().total, 1);
    settle(&service).await;
    assert_eq!(service.get_vm(vm_id).unwrap().state, LifecycleState::Active);

    plane.shutdown().await.unwrap();
}
