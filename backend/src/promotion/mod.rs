pub mod approval;
pub mod orchestrator;

pub use approval::{Approval, ApprovalError, BaselineApprover};
pub use orchestrator::{PromotionError, PromotionOrchestrator};
