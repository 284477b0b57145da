use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod logging;

// ============================================================================
// Identity Types
// ============================================================================

/// An identity account subject to provisioning.
///
/// The name is the registry key and never changes once the principal exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub name: String,
    #[serde(default)]
    pub group_names: BTreeSet<String>,
    /// Contact metadata, attached after the principal exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
    pub password_reset_required: bool,
    /// Vault version token the initial login was issued from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_secret_version: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group_names: BTreeSet::new(),
            contact_email: None,
            password_reset_required: true,
            initial_secret_version: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_group(mut self, group_name: impl Into<String>) -> Self {
        self.group_names.insert(group_name.into());
        self
    }

    pub fn with_initial_secret_version(mut self, version: impl Into<String>) -> Self {
        self.initial_secret_version = Some(version.into());
        self
    }

    pub fn is_member_of(&self, group_name: &str) -> bool {
        self.group_names.contains(group_name)
    }
}

/// A single allow rule. Patterns support a `*` wildcard matching any run of characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub actions: Vec<String>,
    pub resources: Vec<String>,
}

impl PermissionRule {
    pub fn new<A, R>(actions: A, resources: R) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
            resources: resources.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, action: &str, resource: &str) -> bool {
        self.actions.iter().any(|p| wildcard_match(p, action))
            && self.resources.iter().any(|p| wildcard_match(p, resource))
    }
}

/// Named bundle of permission rules. Rules are additive; there is no deny.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<PermissionRule>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            permissions: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: PermissionRule) -> Self {
        self.permissions.push(rule);
        self
    }

    pub fn allows(&self, action: &str, resource: &str) -> bool {
        self.permissions.iter().any(|r| r.allows(action, resource))
    }
}

/// Glob match supporting only `*`.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();
    let (mut pi, mut vi) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while vi < v.len() {
        if pi < p.len() && p[pi] != '*' && p[pi] == v[vi] {
            pi += 1;
            vi += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = vi;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            vi = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

// ============================================================================
// Event and Audit Types
// ============================================================================

/// A "principal created" notification as delivered by the event channel.
///
/// `event_id` identifies the delivery attempt, not the logical creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreationEvent {
    pub event_id: String,
    pub principal_name: String,
    pub occurred_at: DateTime<Utc>,
}

impl CreationEvent {
    pub fn new(event_id: impl Into<String>, principal_name: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            principal_name: principal_name.into(),
            occurred_at: Utc::now(),
        }
    }
}

/// Finished audit record handed to the audit sink. Only `emitted_at` changes
/// after correlation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Stable id so downstream receivers can recognise a manual replay
    pub record_id: String,
    pub principal_name: String,
    pub contact_email: String,
    pub secret_value_at_creation: String,
    /// Restamped every time the record is handed to the sink
    pub emitted_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        principal_name: impl Into<String>,
        contact_email: impl Into<String>,
        secret_value_at_creation: impl Into<String>,
    ) -> Self {
        Self {
            record_id: uuid::Uuid::new_v4().to_string(),
            principal_name: principal_name.into(),
            contact_email: contact_email.into(),
            secret_value_at_creation: secret_value_at_creation.into(),
            emitted_at: Utc::now(),
        }
    }
}

impl fmt::Debug for AuditRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditRecord")
            .field("record_id", &self.record_id)
            .field("principal_name", &self.principal_name)
            .field("contact_email", &self.contact_email)
            .field("secret_value_at_creation", &"***")
            .field("emitted_at", &self.emitted_at)
            .finish()
    }
}

/// Per-principal correlation lifecycle tracked by the dedupe ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorrelationState {
    /// No creation processed yet (or the last attempt failed before joining)
    Pending,
    /// Record built but not accepted by the sink
    Correlated,
    /// Record accepted by the sink; further deliveries are dropped
    Emitted,
}

impl Default for CorrelationState {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for CorrelationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationState::Pending => write!(f, "PENDING"),
            CorrelationState::Correlated => write!(f, "CORRELATED"),
            CorrelationState::Emitted => write!(f, "EMITTED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("ec2:*", "ec2:StartInstances"));
        assert!(wildcard_match("arn:*:bucket/*", "arn:aws:bucket/key"));
        assert!(wildcard_match("exact", "exact"));
        assert!(!wildcard_match("ec2:*", "s3:GetObject"));
        assert!(!wildcard_match("exact", "exactly"));
        assert!(wildcard_match("", ""));
        assert!(!wildcard_match("", "x"));
    }

    #[test]
    fn test_group_rules_are_additive() {
        let group = Group::new("EC2UserGroup")
            .with_rule(PermissionRule::new(["ec2:Describe*"], ["*"]))
            .with_rule(PermissionRule::new(["ec2:StartInstances"], ["arn:aws:ec2:*:instance/dev-*"]));

        assert!(group.allows("ec2:DescribeInstances", "arn:aws:ec2:eu:instance/prod-1"));
        assert!(group.allows("ec2:StartInstances", "arn:aws:ec2:eu:instance/dev-7"));
        assert!(!group.allows("ec2:StartInstances", "arn:aws:ec2:eu:instance/prod-1"));
        assert!(!group.allows("iam:CreateUser", "*"));
    }

    #[test]
    fn test_audit_record_debug_masks_secret() {
        let record = AuditRecord::new("ec2User", "a@x.com", "S3cr3t!value");
        let rendered = format!("{:?}", record);
        assert!(rendered.contains("a@x.com"));
        assert!(!rendered.contains("S3cr3t!value"));
    }

    #[test]
    fn test_creation_event_wire_format() {
        let json = r#"{"eventId":"d-1","principalName":"ec2User","occurredAt":"2024-05-01T10:00:00Z"}"#;
        let event: CreationEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_id, "d-1");
        assert_eq!(event.principal_name, "ec2User");
    }

    #[test]
    fn test_new_principal_requires_reset() {
        let principal = Principal::new("ec2User").with_group("EC2UserGroup");
        assert!(principal.password_reset_required);
        assert!(principal.is_member_of("EC2UserGroup"));
        assert!(principal.contact_email.is_none());
    }
}
