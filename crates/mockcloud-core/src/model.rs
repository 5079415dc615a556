//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Resource records, lifecycle states and request validation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::cidr::Ipv4Network;
use crate::error::ServiceError;

/// Longest name accepted for any resource.
pub const MAX_NAME_LEN: usize = 100;
/// Largest volume the catalog offers, in GiB.
pub const MAX_VOLUME_SIZE_GB: u32 = 10_000;
/// Upper bound for `limit` on list calls.
pub const MAX_PAGE_LIMIT: usize = 1_000;
/// `limit` applied when a list call does not pass one.
pub const DEFAULT_PAGE_LIMIT: usize = 100;
/// Prefix lengths accepted for an Environment network.
pub const ENVIRONMENT_PREFIX_RANGE: std::ops::RangeInclusive<u8> = 8..=30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceKind {
    Environment,
    SecurityGroup,
    Vm,
    Volume,
    Job,
}

impl ResourceKind {
    /// Name used in user-facing messages.
    pub fn label(self) -> &'static str {
        match self {
            ResourceKind::Environment => "Environment",
            ResourceKind::SecurityGroup => "SecurityGroup",
            ResourceKind::Vm => "VM",
            ResourceKind::Volume => "Volume",
            ResourceKind::Job => "Job",
        }
    }
}

/// Lifecycle shared by VMs and Volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LifecycleState {
    Pending,
    Active,
    Error,
    Deleting,
    Deleted,
}

impl LifecycleState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Error)
                | (Active, Deleting)
                | (Error, Deleting)
                | (Deleting, Deleted)
                | (Deleting, Error)
        )
    }

    /// A lifecycle job is outstanding while the record sits in this state.
    pub fn is_transient(self) -> bool {
        matches!(self, LifecycleState::Pending | LifecycleState::Deleting)
    }

    /// States from which a delete request is accepted.
    pub fn accepts_delete(self) -> bool {
        matches!(self, LifecycleState::Active | LifecycleState::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub id: Uuid,
    pub name: String,
    pub network_cidr: Ipv4Network,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RuleDirection {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RuleProtocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
    pub direction: RuleDirection,
    pub protocol: RuleProtocol,
    /// Omitted for `icmp` and `all`.
    #[serde(default)]
    pub port_from: Option<u16>,
    #[serde(default)]
    pub port_to: Option<u16>,
    pub cidr: Ipv4Network,
}

impl SecurityRule {
    fn validate(&self, index: usize) -> Result<(), ServiceError> {
        match (self.protocol, self.port_from, self.port_to) {
            (RuleProtocol::Tcp | RuleProtocol::Udp, Some(from), Some(to)) => {
                if from == 0 || from > to {
                    return Err(ServiceError::validation(format!(
                        "rule {index}: port range {from}-{to} is invalid"
                    )));
                }
                Ok(())
            }
            (RuleProtocol::Tcp | RuleProtocol::Udp, _, _) => Err(ServiceError::validation(
                format!("rule {index}: {} rules need port_from and port_to", self.protocol),
            )),
            (_, None, None) => Ok(()),
            (protocol, _, _) => Err(ServiceError::validation(format!(
                "rule {index}: {protocol} rules do not take ports"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: Uuid,
    pub name: String,
    pub environment_id: Uuid,
    pub description: Option<String>,
    pub rules: Vec<SecurityRule>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    pub id: Uuid,
    pub name: String,
    pub instance_type: String,
    pub environment_id: Uuid,
    pub security_group_id: Option<Uuid>,
    pub state: LifecycleState,
    pub ip_address: Option<Ipv4Addr>,
    pub error_message: Option<String>,
    /// Job that owns the current (or most recent) lifecycle step.
    #[serde(default)]
    pub lifecycle_job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: Uuid,
    pub name: String,
    pub size_gb: u32,
    pub environment_id: Uuid,
    pub state: LifecycleState,
    pub attached_vm_id: Option<Uuid>,
    pub mount_path: Option<String>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub lifecycle_job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Records whose state is driven by lifecycle jobs.
pub trait LifecycleRecord: Clone {
    const KIND: ResourceKind;

    fn id(&self) -> Uuid;
    fn state(&self) -> LifecycleState;
    fn error_message(&self) -> Option<&str>;
    fn lifecycle_job_id(&self) -> Option<Uuid>;
    fn bind_job(&mut self, job_id: Uuid);
    /// Move to `next`, adjusting the attributes the new state owns.
    fn enter(&mut self, next: LifecycleState, error_message: Option<String>, now: DateTime<Utc>);
}

impl LifecycleRecord for Vm {
    const KIND: ResourceKind = ResourceKind::Vm;

    fn id(&self) -> Uuid {
        self.id
    }

    fn state(&self) -> LifecycleState {
        self.state
    }

    fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    fn lifecycle_job_id(&self) -> Option<Uuid> {
        self.lifecycle_job_id
    }

    fn bind_job(&mut self, job_id: Uuid) {
        self.lifecycle_job_id = Some(job_id);
    }

    fn enter(&mut self, next: LifecycleState, error_message: Option<String>, now: DateTime<Utc>) {
        self.state = next;
        self.updated_at = now;
        self.error_message = error_message;
        if next == LifecycleState::Deleted {
            self.ip_address = None;
        }
    }
}

impl LifecycleRecord for Volume {
    const KIND: ResourceKind = ResourceKind::Volume;

    fn id(&self) -> Uuid {
        self.id
    }

    fn state(&self) -> LifecycleState {
        self.state
    }

    fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    fn lifecycle_job_id(&self) -> Option<Uuid> {
        self.lifecycle_job_id
    }

    fn bind_job(&mut self, job_id: Uuid) {
        self.lifecycle_job_id = Some(job_id);
    }

    fn enter(&mut self, next: LifecycleState, error_message: Option<String>, now: DateTime<Utc>) {
        self.state = next;
        self.updated_at = now;
        self.error_message = error_message;
        if next == LifecycleState::Deleted {
            self.attached_vm_id = None;
            self.mount_path = None;
        }
    }
}

fn validate_name(name: &str) -> Result<String, ServiceError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::validation("name must not be empty"));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(ServiceError::validation(format!(
            "name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    Ok(trimmed.to_owned())
}

fn normalize_description(description: Option<String>) -> Option<String> {
    description
        .map(|text| text.trim().to_owned())
        .filter(|text| !text.is_empty())
}

/// Request body for creating an Environment.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateEnvironment {
    pub name: String,
    pub network_cidr: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Environment request that passed validation.
#[derive(Debug, Clone)]
pub struct ValidEnvironment {
    pub name: String,
    pub network_cidr: Ipv4Network,
    pub description: Option<String>,
}

impl CreateEnvironment {
    pub fn validate(self) -> Result<ValidEnvironment, ServiceError> {
        let name = validate_name(&self.name)?;
        let network_cidr: Ipv4Network = self
            .network_cidr
            .parse()
            .map_err(|err| ServiceError::validation(format!("network_cidr: {err}")))?;
        if !ENVIRONMENT_PREFIX_RANGE.contains(&network_cidr.prefix()) {
            return Err(ServiceError::validation(format!(
                "network_cidr: prefix /{} is outside /{}../{}",
                network_cidr.prefix(),
                ENVIRONMENT_PREFIX_RANGE.start(),
                ENVIRONMENT_PREFIX_RANGE.end()
            )));
        }
        Ok(ValidEnvironment {
            name,
            network_cidr,
            description: normalize_description(self.description),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSecurityGroup {
    pub name: String,
    pub environment_id: Uuid,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub rules: Vec<SecurityRule>,
}

impl CreateSecurityGroup {
    pub fn validate(mut self) -> Result<Self, ServiceError> {
        self.name = validate_name(&self.name)?;
        self.description = normalize_description(self.description);
        for (index, rule) in self.rules.iter().enumerate() {
            rule.validate(index)?;
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateVm {
    pub name: String,
    pub instance_type: String,
    pub environment_id: Uuid,
    #[serde(default)]
    pub security_group_id: Option<Uuid>,
}

impl CreateVm {
    /// Check the request against the offered instance types.
    pub fn validate(mut self, instance_types: &[String]) -> Result<Self, ServiceError> {
        self.name = validate_name(&self.name)?;
        let instance_type = self.instance_type.trim();
        if !instance_types.iter().any(|offered| offered == instance_type) {
            return Err(ServiceError::validation(format!(
                "instance_type '{instance_type}' is not offered; choose one of {}",
                instance_types.join(", ")
            )));
        }
        self.instance_type = instance_type.to_owned();
        Ok(self)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateVolume {
    pub name: String,
    pub size_gb: u32,
    pub environment_id: Uuid,
}

impl CreateVolume {
    pub fn validate(mut self) -> Result<Self, ServiceError> {
        self.name = validate_name(&self.name)?;
        if !(1..=MAX_VOLUME_SIZE_GB).contains(&self.size_gb) {
            return Err(ServiceError::validation(format!(
                "size_gb must be between 1 and {MAX_VOLUME_SIZE_GB}, got {}",
                self.size_gb
            )));
        }
        Ok(self)
    }
}

/// Pagination and filters accepted by list calls.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub environment_id: Option<Uuid>,
    #[serde(default)]
    pub state: Option<LifecycleState>,
    #[serde(default)]
    pub skip: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ListQuery {
    pub fn skip(&self) -> usize {
        self.skip.unwrap_or(0)
    }

    pub fn limit(&self) -> Result<usize, ServiceError> {
        match self.limit {
            None => Ok(DEFAULT_PAGE_LIMIT),
            Some(0) => Err(ServiceError::validation("limit must be at least 1")),
            Some(limit) if limit > MAX_PAGE_LIMIT => Err(ServiceError::validation(format!(
                "limit must be at most {MAX_PAGE_LIMIT}"
            ))),
            Some(limit) => Ok(limit),
        }
    }
}

/// One page of records plus the number of matches before paging.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_lifecycle() {
        use LifecycleState::*;
        let all = [Pending, Active, Error, Deleting, Deleted];
        let allowed: Vec<_> = all
            .iter()
            .flat_map(|from| all.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();
        assert_eq!(
            allowed,
            vec![
                (Pending, Active),
                (Pending, Error),
                (Active, Deleting),
                (Error, Deleting),
                (Deleting, Error),
                (Deleting, Deleted),
            ]
        );
        assert!(all.iter().all(|to| !Deleted.can_transition_to(*to)));
    }

    #[test]
    fn states_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&LifecycleState::Deleting).unwrap(), "\"deleting\"");
        assert_eq!("active".parse::<LifecycleState>().unwrap(), LifecycleState::Active);
        assert_eq!(ResourceKind::SecurityGroup.to_string(), "security_group");
    }

    #[test]
    fn names_are_trimmed_and_bounded() {
        assert_eq!(validate_name("  web1 ").unwrap(), "web1");
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN)).is_ok());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn vm_request_requires_offered_instance_type() {
        let offered = vec!["t3.micro".to_owned()];
        let request = CreateVm {
            name: "web1".into(),
            instance_type: "t3.micro".into(),
            environment_id: Uuid::new_v4(),
            security_group_id: None,
        };
        assert!(request.clone().validate(&offered).is_ok());
        let request = CreateVm {
            instance_type: "z9.huge".into(),
            ..request
        };
        assert!(matches!(
            request.validate(&offered),
            Err(ServiceError::Validation { .. })
        ));
    }

    #[test]
    fn environment_cidr_must_fit_prefix_range() {
        let request = |cidr: &str| CreateEnvironment {
            name: "prod".into(),
            network_cidr: cidr.into(),
            description: Some("  ".into()),
        };
        let valid = request("10.0.0.0/16").validate().unwrap();
        assert_eq!(valid.network_cidr.to_string(), "10.0.0.0/16");
        assert_eq!(valid.description, None);
        assert!(request("10.0.0.0/31").validate().is_err());
        assert!(request("10.0.0.0/4").validate().is_err());
        assert!(request("10.0.0.1/16").validate().is_err());
        assert!(request("not-a-cidr").validate().is_err());
    }

    #[test]
    fn volume_size_is_bounded() {
        let request = |size_gb| CreateVolume {
            name: "data".into(),
            size_gb,
            environment_id: Uuid::new_v4(),
        };
        assert!(request(0).validate().is_err());
        assert!(request(1).validate().is_ok());
        assert!(request(MAX_VOLUME_SIZE_GB).validate().is_ok());
        assert!(request(MAX_VOLUME_SIZE_GB + 1).validate().is_err());
    }

    #[test]
    fn rule_ports_follow_protocol() {
        let cidr: Ipv4Network = "0.0.0.0/0".parse().unwrap();
        let rule = |protocol, port_from, port_to| SecurityRule {
            direction: RuleDirection::Ingress,
            protocol,
            port_from,
            port_to,
            cidr,
        };
        assert!(rule(RuleProtocol::Tcp, Some(22), Some(22)).validate(0).is_ok());
        assert!(rule(RuleProtocol::Tcp, Some(443), Some(80)).validate(0).is_err());
        assert!(rule(RuleProtocol::Udp, None, None).validate(0).is_err());
        assert!(rule(RuleProtocol::Icmp, None, None).validate(0).is_ok());
        assert!(rule(RuleProtocol::All, Some(1), Some(2)).validate(0).is_err());
    }

    #[test]
    fn list_limit_defaults_and_caps() {
        assert_eq!(ListQuery::default().limit().unwrap(), DEFAULT_PAGE_LIMIT);
        let query = ListQuery {
            limit: Some(MAX_PAGE_LIMIT + 1),
            ..ListQuery::default()
        };
        assert!(query.limit().is_err());
    }
}
