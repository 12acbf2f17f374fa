//! Shell-argument normalization for tool calls named `shell` (spec §4.6
//! edge case): a bare `command` string, or a single-element array
//! containing one, is rewritten into `["bash", "-c", command]` so
//! upstreams that expect an argv array don't choke on a plain string.
//! Oversized or malformed payloads pass through unchanged rather than
//! risk mangling something the model intentionally sent as-is.

use serde_json::Value;

const MAX_NORMALIZE_BYTES: usize = 50_000;

/// Normalizes the raw JSON-string arguments of a `shell` tool call.
/// Returns the input unchanged if it isn't valid JSON, exceeds the size
/// cap, or doesn't match the shapes this normalizes.
pub fn normalize_shell_arguments(tool_name: &str, raw_arguments: &str) -> String {
    if tool_name != "shell" {
        return raw_arguments.to_string();
    }
    if raw_arguments.len() > MAX_NORMALIZE_BYTES {
        return raw_arguments.to_string();
    }
    let Ok(mut value) = serde_json::from_str::<Value>(raw_arguments) else {
        return raw_arguments.to_string();
    };

    let Some(obj) = value.as_object_mut() else {
        return raw_arguments.to_string();
    };

    let Some(command) = obj.get("command").cloned() else {
        return raw_arguments.to_string();
    };

    let normalized = match command {
        Value::String(cmd) => Some(vec![
            Value::String("bash".to_string()),
            Value::String("-c".to_string()),
            Value::String(cmd),
        ]),
        Value::Array(items) if items.len() == 1 => match &items[0] {
            Value::String(cmd) => Some(vec![
                Value::String("bash".to_string()),
                Value::String("-c".to_string()),
                Value::String(cmd.clone()),
            ]),
            _ => None,
        },
        Value::Array(items) => Some(items),
        _ => None,
    };

    match normalized {
        Some(argv) => {
            obj.insert("command".to_string(), Value::Array(argv));
            serde_json::to_string(&value).unwrap_or_else(|_| raw_arguments.to_string())
        }
        None => raw_arguments.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_string_command_becomes_bash_c_argv() {
        let raw = r#"{"command":"ls -la | wc -l"}"#;
        let out = normalize_shell_arguments("shell", raw);
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["command"], serde_json::json!(["bash", "-c", "ls -la | wc -l"]));
    }

    #[test]
    fn single_element_array_unwraps_to_bash_c() {
        let raw = r#"{"command":["echo hi"]}"#;
        let out = normalize_shell_arguments("shell", raw);
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["command"], serde_json::json!(["bash", "-c", "echo hi"]));
    }

    #[test]
    fn already_argv_array_passes_through() {
        let raw = r#"{"command":["ls","-la"]}"#;
        let out = normalize_shell_arguments("shell", raw);
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["command"], serde_json::json!(["ls", "-la"]));
    }

    #[test]
    fn non_shell_tool_passes_through_untouched() {
        let raw = r#"{"query":"weather in nyc"}"#;
        assert_eq!(normalize_shell_arguments("get_weather", raw), raw);
    }

    #[test]
    fn invalid_json_passes_through_untouched() {
        let raw = "not json";
        assert_eq!(normalize_shell_arguments("shell", raw), raw);
    }

    #[test]
    fn oversized_payload_passes_through_untouched() {
        let raw = format!(r#"{{"command":"{}"}}"#, "a".repeat(60_000));
        assert_eq!(normalize_shell_arguments("shell", &raw), raw);
    }
}
