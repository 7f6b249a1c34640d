use colored::Colorize;

use crate::device::{DeviceState, DeviceStatus};
use crate::state::models::{
    Activity, BatchHostResult, BatchSummary, Host, HostScriptResult, Script,
};

/// Print a success message.
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg.green());
}

/// Print an error message.
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg.red());
}

/// Print a host record.
pub fn print_host(host: &Host) {
    println!();
    println!("{} {}", "Host:".bold().cyan(), host.id.to_string().bold());
    println!("{}", "─".repeat(60));
    println!("  {:<18} {}", "UUID:".bold(), host.uuid);
    println!("  {:<18} {}", "Platform:".bold(), host.platform);
    println!("  {:<18} {}", "Team:".bold(), team_label(host.team_id));
    println!("  {:<18} {}", "Agent:".bold(), yes_no(host.has_agent));
    println!("  {:<18} {}", "Scripts enabled:".bold(), yes_no(host.scripts_enabled));
    println!();
}

/// Print a host's pending activities, activated first.
pub fn print_activity_list(host_id: i64, activities: &[Activity]) {
    if activities.is_empty() {
        println!("{}", format!("No pending activities for host {}.", host_id).dimmed());
        return;
    }

    println!();
    println!("{} {}", "Activities for host".bold().cyan(), host_id.to_string().bold());
    println!("{}", "─".repeat(90));
    println!(
        "  {:<38} {:<20} {:>8}  {:<10} {}",
        "EXECUTION".bold(),
        "TYPE".bold(),
        "PRIORITY".bold(),
        "STATUS".bold(),
        "CREATED".bold()
    );
    println!("{}", "─".repeat(90));

    for activity in activities {
        let status = if activity.is_activated() {
            "activated".green().to_string()
        } else {
            "queued".dimmed().to_string()
        };
        println!(
            "  {:<38} {:<20} {:>8}  {:<10} {}",
            activity.execution_id,
            activity.activity_type.as_str(),
            activity.priority,
            status,
            activity.created_at.dimmed()
        );
    }

    println!();
    println!("  {} activit(ies) pending.", activities.len());
    println!();
}

/// Print a script execution, terminal or still pending.
pub fn print_script_result(result: &HostScriptResult) {
    let status = if result.canceled {
        "canceled".yellow().to_string()
    } else if result.timed_out {
        "timed out".red().to_string()
    } else {
        match result.exit_code {
            Some(0) => "ran".green().to_string(),
            Some(_) => "errored".red().to_string(),
            None => "pending".blue().to_string(),
        }
    };

    println!();
    println!("{} {}", "Execution:".bold().cyan(), result.execution_id.bold());
    println!("{}", "─".repeat(60));
    println!("  {:<18} {}", "Host:".bold(), result.host_id);
    println!("  {:<18} {}", "Type:".bold(), result.activity_type);
    if let Some(script_id) = result.script_id {
        println!("  {:<18} {}", "Script:".bold(), script_id);
    }
    println!("  {:<18} {}", "Status:".bold(), status);
    if let Some(code) = result.exit_code {
        println!("  {:<18} {}", "Exit code:".bold(), code);
    }
    println!("  {:<18} {}s", "Runtime:".bold(), result.runtime);
    if let Some(ref requester) = result.requester {
        println!("  {:<18} {}", "Requested by:".bold(), requester);
    }
    println!("  {:<18} {}", "Created:".bold(), result.created_at);

    if !result.output.is_empty() {
        println!();
        println!("  {}:", "Output".bold());
        for line in result.output.lines() {
            println!("    {}", line);
        }
    }
    println!("{}", "─".repeat(60));
    println!();
}

/// Print the scripts of a scope.
pub fn print_script_list(scripts: &[Script]) {
    if scripts.is_empty() {
        println!("{}", "No scripts.".dimmed());
        return;
    }

    println!();
    println!("{}", "Scripts".bold().cyan());
    println!("{}", "─".repeat(80));
    println!(
        "  {:<6} {:<32} {:<8} {}",
        "ID".bold(),
        "NAME".bold(),
        "TEAM".bold(),
        "UPDATED".bold()
    );
    println!("{}", "─".repeat(80));
    for script in scripts {
        println!(
            "  {:<6} {:<32} {:<8} {}",
            script.id,
            script.name,
            team_label(script.team_id),
            script.updated_at.dimmed()
        );
    }
    println!();
    println!("  {} script(s) total.", scripts.len());
    println!();
}

/// Print the lock/wipe status of a host.
pub fn print_device_status(status: &DeviceStatus) {
    let state = match &status.state {
        DeviceState::Unlocked => status.state.to_string().green().to_string(),
        DeviceState::Locked | DeviceState::Wiped => status.state.to_string().red().to_string(),
        _ => status.state.to_string().yellow().to_string(),
    };

    println!();
    println!("{} {}", "Device:".bold().cyan(), status.host_id.to_string().bold());
    println!("{}", "─".repeat(60));
    println!("  {:<18} {}", "Platform:".bold(), status.platform);
    println!("  {:<18} {}", "State:".bold(), state);
    if let Some(pin) = &status.unlock_pin {
        println!("  {:<18} {}", "Unlock PIN:".bold(), pin);
    }
    if let Some(since) = status.unlock_eligible_since {
        println!("  {:<18} {}", "Unlockable since:".bold(), since.to_rfc3339());
    }
    if let DeviceState::UnlockPending {
        requested_at: Some(at),
        ..
    } = &status.state
    {
        println!("  {:<18} {}", "Unlock requested:".bold(), at.to_rfc3339());
    }
    for (label, value) in [
        ("Lock ref:", &status.actions.lock_ref),
        ("Unlock ref:", &status.actions.unlock_ref),
        ("Wipe ref:", &status.actions.wipe_ref),
    ] {
        if let Some(value) = value {
            println!("  {:<18} {}", label.bold(), value.dimmed());
        }
    }
    println!();
}

/// Print the aggregate counts of a batch and, when given, per-host rows.
pub fn print_batch_summary(summary: &BatchSummary, hosts: &[BatchHostResult]) {
    println!();
    println!("{} {}", "Batch:".bold().cyan(), summary.batch_id.bold());
    println!("{}", "─".repeat(60));
    if let Some(ref name) = summary.script_name {
        println!("  {:<18} {}", "Script:".bold(), name);
    }
    println!("  {:<18} {}", "Team:".bold(), team_label(summary.team_id));
    println!("  {:<18} {}", "Created:".bold(), summary.created_at);
    println!();
    println!(
        "  {} targeted, {} ran, {} errored, {} canceled, {} pending",
        summary.targeted.to_string().bold(),
        summary.ran.to_string().green(),
        summary.errored.to_string().red(),
        summary.canceled.to_string().yellow(),
        summary.pending.to_string().blue()
    );

    if !hosts.is_empty() {
        println!();
        for host in hosts {
            match (&host.error, &host.host_execution_id) {
                (Some(err), _) => println!("  {:<8} {}", host.host_id, err.red()),
                (None, Some(exec)) => println!("  {:<8} {}", host.host_id, exec.dimmed()),
                (None, None) => println!("  {:<8} {}", host.host_id, "-".dimmed()),
            }
        }
    }
    println!();
}

fn team_label(team_id: Option<i64>) -> String {
    team_id.map_or_else(|| "global".to_string(), |id| id.to_string())
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}
