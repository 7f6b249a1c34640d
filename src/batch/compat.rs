use crate::scripts::validation::ScriptKind;
use crate::state::models::Host;

/// Recorded for hosts without an agent able to run scripts.
pub const INCOMPATIBLE_AGENT: &str = "incompatible-agent";
/// Recorded for hosts whose platform cannot run the script's interpreter.
pub const INCOMPATIBLE_PLATFORM: &str = "incompatible-platform";

/// Per-host pre-flight check. Returns the error to record, if any.
pub fn preflight(host: &Host, kind: ScriptKind) -> Option<&'static str> {
    if !host.has_agent || !host.scripts_enabled {
        return Some(INCOMPATIBLE_AGENT);
    }
    if !kind.runs_on(host.platform) {
        return Some(INCOMPATIBLE_PLATFORM);
    }
    None
}
