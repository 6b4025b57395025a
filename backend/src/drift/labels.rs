use flowops_shared::{DriftStatus, EnvironmentClass};

pub struct StatusDisplay {
    pub label: &'static str,
    pub remediation_hint: &'static str,
}

const fn display(label: &'static str, remediation_hint: &'static str) -> StatusDisplay {
    StatusDisplay {
        label,
        remediation_hint,
    }
}

/// Display label and remediation hint for a status in an environment class.
///
/// Only `New` and `Drift` read differently in dev, where the runtime is the
/// authoring surface.
pub fn status_display(status: DriftStatus, class: EnvironmentClass) -> StatusDisplay {
    use DriftStatus::*;

    match (status, class.is_dev()) {
        (Unknown, _) => display("Unknown", "Run a scan to collect state for this environment"),
        (New, true) => display("No baseline", "Approve the current runtime version to set a baseline"),
        (New, false) => display("Not onboarded", "Promote this workflow from a lower environment or approve it to onboard"),
        (InSync, _) => display("In sync", "No action needed"),
        (Drift, true) => display("Pending sync", "Approve the runtime changes to commit them as the new baseline"),
        // Dev never yields DriftDetected; keep the incident wording if it ever does
        (Drift, false) | (DriftDetected, _) => display("Drift detected", "Revert the runtime change or promote the approved version from Git"),
        (GitUnavailable, _) => display("Git unavailable", "Verify repository URL and credentials"),
        (DeployMissing, _) => display("Deploy missing", "Deploy the Git version of this workflow to the runtime"),
        (Unmanaged, _) => display("Unmanaged", "Configure a Git repository for this environment"),
        (Error, _) => display("Error", "Check runtime connectivity and the workflow definition, then rescan"),
    }
}
