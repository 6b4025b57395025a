use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================
// Environments
// ============================================

/// Environment class decides which side is the source of truth.
/// In `Dev` the runtime is authoritative, everywhere else Git is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentClass {
    Dev,
    Staging,
    Production,
}

impl EnvironmentClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }

    pub fn is_dev(&self) -> bool {
        matches!(self, Self::Dev)
    }
}

impl FromStr for EnvironmentClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Dev),
            "staging" | "stage" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!("unknown environment class '{}'", other)),
        }
    }
}

/// Git repository tracked by an environment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GitTarget {
    /// Repository in `owner/name` form
    pub repository: String,
    pub branch: String,
    /// Directory holding one `<canonical_id>.json` file per workflow
    pub path_prefix: String,
    #[serde(skip_serializing, default)]
    pub token: String,
}

impl GitTarget {
    pub fn workflow_path(&self, canonical_workflow_id: Uuid) -> String {
        let prefix = self.path_prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{}.json", canonical_workflow_id)
        } else {
            format!("{}/{}.json", prefix, canonical_workflow_id)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub class: EnvironmentClass,
    pub runtime_base_url: String,
    #[serde(skip_serializing, default)]
    pub runtime_api_key: String, // Never returned by the API
    pub git: Option<GitTarget>,
    pub last_git_head: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Environment {
    pub fn git_configured(&self) -> bool {
        self.git.is_some()
    }
}

// ============================================
// Canonical identity
// ============================================

/// Canonical content hash of a normalized workflow definition (`sha256:<hex>`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalWorkflow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub content_hash: Option<String>,
    pub git_path: Option<String>,
    pub git_commit_sha: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CanonicalWorkflow {
    pub fn content_hash(&self) -> Option<ContentHash> {
        self.content_hash.clone().map(ContentHash::new)
    }
}

/// Which runtime workflow represents a canonical workflow inside one environment
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeLink {
    pub environment_id: Uuid,
    pub canonical_workflow_id: Uuid,
    pub runtime_workflow_id: String,
}

// ============================================
// Drift state
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriftStatus {
    Unknown,
    New,
    InSync,
    Drift,
    DriftDetected,
    GitUnavailable,
    DeployMissing,
    Unmanaged,
    Error,
}

impl DriftStatus {
    pub const ALL: [DriftStatus; 9] = [
        Self::Unknown,
        Self::New,
        Self::InSync,
        Self::Drift,
        Self::DriftDetected,
        Self::GitUnavailable,
        Self::DeployMissing,
        Self::Unmanaged,
        Self::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::New => "NEW",
            Self::InSync => "IN_SYNC",
            Self::Drift => "DRIFT",
            Self::DriftDetected => "DRIFT_DETECTED",
            Self::GitUnavailable => "GIT_UNAVAILABLE",
            Self::DeployMissing => "DEPLOY_MISSING",
            Self::Unmanaged => "UNMANAGED",
            Self::Error => "ERROR",
        }
    }

    /// Rank used when rolling workflow statuses up to one environment status
    pub fn severity(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::InSync => 1,
            Self::New => 2,
            Self::Unmanaged => 3,
            Self::DeployMissing => 4,
            Self::Drift => 5,
            Self::DriftDetected => 6,
            Self::Error => 7,
            Self::GitUnavailable => 8,
        }
    }

    /// Statuses that should open an incident
    pub fn is_incident(&self) -> bool {
        matches!(self, Self::DriftDetected)
    }
}

impl FromStr for DriftStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown drift status '{}'", s))
    }
}

impl fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per (canonical workflow, environment)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentWorkflowState {
    pub tenant_id: Uuid,
    pub environment_id: Uuid,
    pub canonical_workflow_id: Uuid,
    pub baseline_hash: Option<ContentHash>,
    pub runtime_hash: Option<ContentHash>,
    pub git_hash: Option<ContentHash>,
    pub git_configured: bool,
    pub status: DriftStatus,
    pub error_message: Option<String>,
    /// Start time of the scan (or approval) that produced this row
    pub scan_started_at: DateTime<Utc>,
    pub last_checked_at: DateTime<Utc>,
}

impl EnvironmentWorkflowState {
    pub fn runtime_exists(&self) -> bool {
        self.runtime_hash.is_some()
    }

    /// Git holds a version that differs from the approved baseline
    pub fn git_ahead(&self) -> bool {
        match (&self.git_hash, &self.baseline_hash) {
            (Some(git), Some(baseline)) => git != baseline,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Drift status as returned by the API, with display label and remediation hint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftStatusView {
    pub canonical_workflow_id: Uuid,
    pub workflow_name: Option<String>,
    pub environment_id: Uuid,
    pub status: DriftStatus,
    pub label: String,
    pub remediation_hint: String,
    pub baseline_hash: Option<ContentHash>,
    pub runtime_hash: Option<ContentHash>,
    pub git_hash: Option<ContentHash>,
    pub git_configured: bool,
    pub git_ahead: bool,
    pub error_message: Option<String>,
    pub last_checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub environment_id: Uuid,
    pub environment_status: DriftStatus,
    pub label: String,
    pub remediation_hint: String,
    pub scan_started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub git_head: Option<String>,
    pub git_changed_paths: Vec<String>,
    pub workflows: Vec<DriftStatusView>,
    /// Rows skipped because a newer scan already stored a result
    pub discarded_stale: usize,
}

// ============================================
// Credentials
// ============================================

/// Build the logical key `"<type>:<name>"`
pub fn logical_key(credential_type: &str, name: &str) -> String {
    format!("{}:{}", credential_type, name)
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogicalCredential {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub key: String,
    pub name: String,
    pub required_type: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialMapping {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub logical_credential_id: Uuid,
    pub environment_id: Uuid,
    pub physical_credential_id: String,
    pub physical_name: String,
    pub physical_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

// ============================================
// Preflight
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreflightIssueKind {
    WorkflowNotFound,
    NoLogicalCredential,
    MissingMapping,
    MappedMissingInTarget,
}

impl PreflightIssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowNotFound => "workflow_not_found",
            Self::NoLogicalCredential => "no_logical_credential",
            Self::MissingMapping => "missing_mapping",
            Self::MappedMissingInTarget => "mapped_missing_in_target",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreflightIssue {
    pub kind: PreflightIssueKind,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub logical_key: Option<String>,
    pub blocking: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedMapping {
    pub workflow_id: Uuid,
    pub logical_key: String,
    pub credential_type: String,
    pub source_physical_id: Option<String>,
    pub source_physical_name: String,
    pub target_physical_id: String,
    pub target_physical_name: String,
    /// Logical credential and mapping will be created on promotion
    pub auto_create: bool,
}

/// Computed fresh for every promotion attempt, never authoritative
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreflightResult {
    pub source_environment_id: Uuid,
    pub target_environment_id: Uuid,
    pub blocking_issues: Vec<PreflightIssue>,
    pub warnings: Vec<PreflightIssue>,
    pub resolved_mappings: Vec<ResolvedMapping>,
    pub checked_at: DateTime<Utc>,
}

impl PreflightResult {
    pub fn is_clear(&self) -> bool {
        self.blocking_issues.is_empty()
    }
}

// ============================================
// Promotions
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromotionState {
    Pending,
    PreflightChecked,
    Applying,
    Completed,
    Failed,
}

impl PromotionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::PreflightChecked => "PREFLIGHT_CHECKED",
            Self::Applying => "APPLYING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Allowed transitions of the promotion state machine
    pub fn can_transition_to(&self, next: PromotionState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::PreflightChecked)
                | (Self::Pending, Self::Failed)
                | (Self::PreflightChecked, Self::Applying)
                | (Self::PreflightChecked, Self::Failed)
                | (Self::Applying, Self::Completed)
                | (Self::Applying, Self::Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowPromotionResult {
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub succeeded: bool,
    pub runtime_workflow_id: Option<String>,
    pub applied_hash: Option<ContentHash>,
    pub error: Option<String>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Promotion {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub source_environment_id: Uuid,
    pub target_environment_id: Uuid,
    pub workflow_ids: Vec<Uuid>,
    pub state: PromotionState,
    pub preflight: Option<PreflightResult>,
    pub results: Vec<WorkflowPromotionResult>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
