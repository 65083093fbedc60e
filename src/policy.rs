//! Action policy: maps a classification to the mailbox action to take.

use crate::config::RunConfig;
use crate::models::{ActionDecision, ActionKind, Category, Classification};

pub const REASON_DRY_RUN: &str = "dry-run";
pub const REASON_BELOW_THRESHOLD: &str = "below threshold";
pub const REASON_AUTO_DELETE: &str = "auto-delete junk";
pub const REASON_PROMOTIONAL: &str = "promotional routing";
pub const REASON_NO_ACTION: &str = "no action for category";

/// Decide what to do with a classified message. Pure.
///
/// Rules, first match wins:
/// 1. dry-run: report what the live rules would pick, never executed
/// 2. confidence below the threshold (inclusive bound, NaN counts as below): NONE
/// 3. JUNK with auto-delete enabled: DELETE
/// 4. PROMOTIONAL with a promotional folder configured: MOVE there
/// 5. otherwise NONE
pub fn decide(classification: &Classification, config: &RunConfig) -> ActionDecision {
    let live = decide_live(classification, config);

    if config.dry_run {
        return ActionDecision {
            executed: false,
            reason: REASON_DRY_RUN.to_string(),
            ..live
        };
    }

    live
}

fn decide_live(classification: &Classification, config: &RunConfig) -> ActionDecision {
    let decision = |action: ActionKind, target_folder: Option<String>, reason: &str| ActionDecision {
        message_id: classification.message_id.clone(),
        executed: action != ActionKind::None,
        action,
        target_folder,
        reason: reason.to_string(),
        error: None,
    };

    // `!(a >= b)` so that a NaN confidence never meets the threshold
    if !(classification.confidence >= config.confidence_threshold) {
        return decision(ActionKind::None, None, REASON_BELOW_THRESHOLD);
    }

    match classification.category {
        Category::Junk if config.auto_delete => {
            decision(ActionKind::Delete, None, REASON_AUTO_DELETE)
        }
        Category::Promotional => match &config.promotional_folder {
            Some(folder) => decision(ActionKind::Move, Some(folder.clone()), REASON_PROMOTIONAL),
            None => decision(ActionKind::None, None, REASON_NO_ACTION),
        },
        _ => decision(ActionKind::None, None, REASON_NO_ACTION),
    }
}
