use crate::model::{RunReport, TargetReport, TargetStatus};

pub fn render_markdown_summary(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str("# Coldscan Run Summary\n\n");
    out.push_str(&format!(
        "- Report version: `{}`\n- Run id: `{}`\n- Started at: `{}`\n- Finished at: `{}`\n- Host: `{}` in `{}`\n- Targets: {} ({} failed)\n- Matches: {}\n\n",
        report.report_version,
        report.run_id,
        report.started_at,
        report.finished_at,
        report.instance_id.as_deref().unwrap_or("unknown"),
        report.availability_zone.as_deref().unwrap_or("unknown"),
        report.targets.len(),
        report.failed_targets(),
        report.total_matches()
    ));

    out.push_str("## Targets\n\n");
    if report.targets.is_empty() {
        out.push_str("No targets were selected.\n\n");
    } else {
        out.push_str("| Target | Status | Scanned | Skipped | Errors | Suppressed | Matches | Elapsed |\n");
        out.push_str("| --- | --- | ---: | ---: | ---: | ---: | ---: | ---: |\n");
        for target in &report.targets {
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} | {} | {} ms |\n",
                target.target,
                status_label(target.status),
                target.subjects_scanned,
                target.subjects_skipped,
                target.scan_errors,
                target.suppressed_errors,
                target.matches.len(),
                target.elapsed_ms
            ));
        }
        out.push('\n');
    }

    let failed: Vec<&TargetReport> = report
        .targets
        .iter()
        .filter(|target| !target.succeeded())
        .collect();
    if !failed.is_empty() {
        out.push_str("## Failures\n\n");
        for target in failed {
            out.push_str(&format!(
                "- {}: {}\n",
                target.target,
                target.error.as_deref().unwrap_or("no error recorded")
            ));
            if let Some(volume_id) = &target.ephemeral_volume_id {
                out.push_str(&format!("  - snapshot volume: `{volume_id}`\n"));
            }
        }
        out.push('\n');
    }

    out.push_str("## Matches\n\n");
    if report.total_matches() == 0 {
        out.push_str("No rule matched.\n");
        return out;
    }
    for target in &report.targets {
        for found in &target.matches {
            out.push_str(&format!(
                "- {} `{}`: rule `{}` from `{}`",
                found.target, found.subject_label, found.rule_name, found.rule_namespace
            ));
            if let Some(digest) = &found.digest {
                out.push_str(&format!(" (blake3 `{digest}`)"));
            }
            out.push('\n');
        }
    }

    out
}

fn status_label(status: TargetStatus) -> &'static str {
    match status {
        TargetStatus::Succeeded => "ok",
        TargetStatus::Failed => "FAILED",
    }
}
