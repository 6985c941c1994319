//! Human readable and JSON output of a sync run.

use std::fmt::Write;

use ds_reconciler::{
    DomainOutcome, MultiReconcileResult, OperationResult, PlannedOperation, ReconcileStatus,
};

fn status_label(status: &ReconcileStatus) -> &'static str {
    match status {
        ReconcileStatus::Converged => "converged",
        ReconcileStatus::PartiallyConverged { .. } => "partially converged",
        ReconcileStatus::SensitiveChange => "held back",
        ReconcileStatus::Planned => "planned",
        ReconcileStatus::Aborted { .. } => "aborted",
    }
}

fn render_domain(out: &mut String, outcome: &DomainOutcome) {
    let _ = writeln!(out, "{}: {}", outcome.domain, status_label(&outcome.status));

    if let ReconcileStatus::Aborted { stage, reason } = &outcome.status {
        let _ = writeln!(out, "  [!] aborted during {stage}: {reason}");
        return;
    }
    let Some(plan) = &outcome.plan else {
        return;
    };

    for anchor in &plan.unchanged {
        let _ = writeln!(out, "  [=] DS {anchor} already in sync");
    }

    match &outcome.status {
        ReconcileStatus::Planned => {
            for operation in plan.operations() {
                let marker = if operation.is_add() { "[+]" } else { "[-]" };
                let _ = writeln!(out, "  {marker} would {operation}");
            }
        }
        ReconcileStatus::SensitiveChange => {
            for remote in &plan.to_remove {
                let _ = writeln!(out, "  [!] kept DS {} (id {})", remote.anchor, remote.id);
            }
            let _ = writeln!(
                out,
                "  [!] no key-signing key published. Re-run with --allow-empty to remove all DS records."
            );
        }
        _ => {
            for executed in &outcome.operations {
                match (&executed.result, &executed.operation) {
                    (OperationResult::Applied, PlannedOperation::Add { anchor }) => {
                        let _ = writeln!(out, "  [+] added DS {anchor}");
                    }
                    (OperationResult::Applied, PlannedOperation::Remove { anchor, id }) => {
                        let _ = writeln!(out, "  [-] deleted stale DS {anchor} (id {id})");
                    }
                    (OperationResult::Failed(reason), operation) => {
                        let _ = writeln!(out, "  [!] failed to {operation}: {reason}");
                    }
                }
            }
        }
    }
}

/// One block per domain followed by a summary line.
pub fn render_text(result: &MultiReconcileResult) -> String {
    let mut out = String::new();
    for outcome in result.outcomes() {
        render_domain(&mut out, outcome);
    }
    for domain in result.cancelled() {
        let _ = writeln!(out, "{domain}: cancelled");
    }

    let _ = writeln!(
        out,
        "{} domains: {} converged, {} planned, {} partially converged, {} held back, {} aborted, {} cancelled",
        result.len(),
        result.converged().len(),
        result.planned().len(),
        result.partially_converged().len(),
        result.sensitive().len(),
        result.aborted().len(),
        result.cancelled().len()
    );
    out
}

pub fn render_json(result: &MultiReconcileResult) -> serde_json::Result<String> {
    serde_json::to_string_pretty(result)
}
