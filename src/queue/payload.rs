use serde_json::Value;

use crate::error::HostqError;
use crate::state::models::{ActivityType, ScriptActivityFields};

/// Check that `payload` has what an activity of `activity_type` needs.
///
/// Returns the script columns for activities that run a script.
pub fn validate(
    activity_type: ActivityType,
    payload: &Value,
) -> Result<Option<ScriptActivityFields>, HostqError> {
    let obj = payload.as_object().ok_or_else(|| {
        HostqError::validation(format!("{} payload must be a JSON object", activity_type))
    })?;

    match activity_type {
        ActivityType::Script => {
            let script_content_id = required_id(obj, "script_content_id", activity_type)?;
            Ok(Some(ScriptActivityFields {
                script_id: optional_id(obj, "script_id", activity_type)?,
                script_content_id,
                sync_request: optional_bool(obj, "sync_request", activity_type)?,
                requester: optional_str(obj, "requester", activity_type)?,
            }))
        }
        ActivityType::SoftwareUninstall => {
            required_id(obj, "installer_id", activity_type)?;
            let script_content_id = required_id(obj, "script_content_id", activity_type)?;
            Ok(Some(ScriptActivityFields {
                script_id: None,
                script_content_id,
                sync_request: false,
                requester: optional_str(obj, "requester", activity_type)?,
            }))
        }
        ActivityType::SoftwareInstall => {
            required_id(obj, "installer_id", activity_type)?;
            Ok(None)
        }
        ActivityType::MdmCommand => {
            match obj.get("command_uuid").and_then(Value::as_str) {
                Some(s) if !s.trim().is_empty() => Ok(None),
                _ => Err(HostqError::validation(format!(
                    "{} payload requires a non-empty string 'command_uuid'",
                    activity_type
                ))),
            }
        }
    }
}

type Object = serde_json::Map<String, Value>;

fn required_id(obj: &Object, key: &str, t: ActivityType) -> Result<i64, HostqError> {
    optional_id(obj, key, t)?.ok_or_else(|| {
        HostqError::validation(format!("{} payload requires '{}'", t, key))
    })
}

fn optional_id(obj: &Object, key: &str, t: ActivityType) -> Result<Option<i64>, HostqError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_i64() {
            Some(id) if id > 0 => Ok(Some(id)),
            _ => Err(HostqError::validation(format!(
                "{} payload field '{}' must be a positive integer",
                t, key
            ))),
        },
    }
}

fn optional_bool(obj: &Object, key: &str, t: ActivityType) -> Result<bool, HostqError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(HostqError::validation(format!(
            "{} payload field '{}' must be a boolean",
            t, key
        ))),
    }
}

fn optional_str(obj: &Object, key: &str, t: ActivityType) -> Result<Option<String>, HostqError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(HostqError::validation(format!(
            "{} payload field '{}' must be a string",
            t, key
        ))),
    }
}
