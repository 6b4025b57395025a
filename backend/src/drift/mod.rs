pub mod classifier;
pub mod labels;
pub mod scanner;

use labels::status_display;
pub use scanner::{EnvironmentScanner, ScanError};

use flowops_shared::{DriftStatusView, EnvironmentClass, EnvironmentWorkflowState};

/// API view of a stored state row
pub fn status_view(
    state: &EnvironmentWorkflowState,
    workflow_name: Option<String>,
    class: EnvironmentClass,
) -> DriftStatusView {
    let shown = status_display(state.status, class);
    DriftStatusView {
        canonical_workflow_id: state.canonical_workflow_id,
        workflow_name,
        environment_id: state.environment_id,
        status: state.status,
        label: shown.label.to_string(),
        remediation_hint: shown.remediation_hint.to_string(),
        baseline_hash: state.baseline_hash.clone(),
        runtime_hash: state.runtime_hash.clone(),
        git_hash: state.git_hash.clone(),
        git_configured: state.git_configured,
        git_ahead: state.git_ahead(),
        error_message: state.error_message.clone(),
        last_checked_at: state.last_checked_at,
    }
}
