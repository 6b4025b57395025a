// Drift Scan Job - Scans every registered environment for drift

use std::sync::Arc;
use tracing::{info, warn};

use crate::drift::EnvironmentScanner;

use super::JobResult;

pub struct DriftScanJob {
    scanner: Arc<EnvironmentScanner>,
}

#[derive(Debug, Default)]
pub struct DriftScanResult {
    pub environments_scanned: i32,
    pub workflows_checked: i32,
    pub incidents: i32,
    pub errors: Vec<String>,
}

impl DriftScanJob {
    pub fn new(scanner: Arc<EnvironmentScanner>) -> Self {
        Self { scanner }
    }

    pub async fn run(&self) -> JobResult<DriftScanResult> {
        let mut result = DriftScanResult::default();

        for (environment_id, scan) in self.scanner.scan_all().await? {
            match scan {
                Ok(report) => {
                    result.environments_scanned += 1;
                    result.workflows_checked += report.workflows.len() as i32;
                    if report.environment_status.is_incident() {
                        result.incidents += 1;
                        warn!(
                            "Environment {} needs attention: {}",
                            environment_id, report.label
                        );
                    }
                }
                Err(e) => {
                    result.errors.push(format!("{}: {}", environment_id, e));
                }
            }
        }

        info!(
            "Drift scan checked {} workflows across {} environments, {} need attention",
            result.workflows_checked, result.environments_scanned, result.incidents
        );
        Ok(result)
    }
}
