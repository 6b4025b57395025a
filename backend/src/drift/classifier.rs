use flowops_shared::{ContentHash, DriftStatus, EnvironmentClass};

/// Everything the classifier needs to decide one (workflow, environment) pair
#[derive(Debug, Clone)]
pub struct ClassifierInput<'a> {
    pub baseline_hash: Option<&'a ContentHash>,
    pub runtime_hash: Option<&'a ContentHash>,
    pub git_hash: Option<&'a ContentHash>,
    pub git_configured: bool,
    pub runtime_exists: bool,
    pub class: EnvironmentClass,
}

/// Classify one workflow in one environment. Pure; recomputed on every scan.
pub fn classify(input: &ClassifierInput<'_>) -> DriftStatus {
    let git_present = input.git_configured && input.git_hash.is_some();

    if !input.runtime_exists && git_present {
        return DriftStatus::DeployMissing;
    }

    let Some(baseline) = input.baseline_hash else {
        return if input.runtime_exists {
            DriftStatus::New
        } else {
            DriftStatus::Unknown
        };
    };

    match input.runtime_hash {
        Some(runtime) if runtime == baseline => DriftStatus::InSync,
        _ if input.class.is_dev() => DriftStatus::Drift,
        _ => DriftStatus::DriftDetected,
    }
}

/// Roll per-workflow statuses up to one status for the environment.
pub fn classify_environment(
    git_configured: bool,
    git_failed: bool,
    statuses: &[DriftStatus],
) -> DriftStatus {
    if git_failed {
        return DriftStatus::GitUnavailable;
    }
    if statuses.is_empty() {
        return DriftStatus::Unknown;
    }
    if !git_configured {
        return DriftStatus::Unmanaged;
    }
    statuses
        .iter()
        .copied()
        .max_by_key(DriftStatus::severity)
        .unwrap_or(DriftStatus::Unknown)
}
