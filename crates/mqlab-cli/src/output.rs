use mqlab_domain::ExperimentId;
use mqlab_reclaim::ReclaimPlan;
use mqlab_store::ExperimentSummary;

/// Render the experiment listing as plain text.
pub fn render_list(summaries: &[ExperimentSummary]) -> String {
    if summaries.is_empty() {
        return "No experiments stored.\n".to_string();
    }
    let mut out = String::new();
    for summary in summaries {
        let created = summary
            .created_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string());
        let marker = if summary.is_latest { "  (latest)" } else { "" };
        out.push_str(&format!("{}  {}{}\n", summary.id, created, marker));
    }
    out
}

/// Render a dry-run reclaim plan, partitioned by kind.
pub fn render_plan(experiment: &ExperimentId, plan: &ReclaimPlan) -> String {
    let mut out = format!("Reclaim plan for {}:\n", experiment);
    if plan.is_empty() {
        out.push_str("  nothing tagged; scope is already empty\n");
        return out;
    }
    let kinds: [(&str, Vec<&str>); 7] = [
        ("instances", plan.instances.iter().map(String::as_str).collect()),
        ("volumes", plan.volumes.iter().map(String::as_str).collect()),
        ("security groups", plan.security_groups.iter().map(String::as_str).collect()),
        ("subnets", plan.subnets.iter().map(String::as_str).collect()),
        ("route tables", plan.route_tables.iter().map(String::as_str).collect()),
        (
            "internet gateways",
            plan.internet_gateways.iter().map(|g| g.id.as_str()).collect(),
        ),
        ("vpcs", plan.vpcs.iter().map(String::as_str).collect()),
    ];
    for (kind, ids) in kinds {
        if ids.is_empty() {
            continue;
        }
        out.push_str(&format!("  {}:\n", kind));
        for id in ids {
            out.push_str(&format!("    {}\n", id));
        }
    }
    out.push_str(&format!("  total: {}\n", plan.total()));
    out
}
