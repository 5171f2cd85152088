//! Tools the model can call, and the registry that executes them.

use crate::error::ToolError;
use crate::types::ToolDefinition;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// A function the model may invoke by name.
#[async_trait]
pub trait ToolCallback: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the tool's arguments.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Run the tool. The output is handed back to the model as text.
    async fn call(&self, args: serde_json::Value) -> Result<String, ToolError>;

    /// Maximum execution time before timeout.
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Tools available to a chat client, ordered by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn ToolCallback>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Returns error if a tool with the same name is already registered.
    pub fn register(&mut self, tool: Arc<dyn ToolCallback>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::AlreadyRegistered { name });
        }
        debug!(tool = %name, "Registering tool");
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn register_all(
        &mut self,
        tools: impl IntoIterator<Item = Arc<dyn ToolCallback>>,
    ) -> Result<(), ToolError> {
        tools.into_iter().try_for_each(|tool| self.register(tool))
    }

    pub fn unregister(&mut self, name: &str) -> Result<(), ToolError> {
        self.tools
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ToolError::NotFound {
                name: name.to_string(),
            })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolCallback>> {
        self.tools.get(name).cloned()
    }

    /// Definitions to send to the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|tool| tool.definition()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool by name, applying its timeout.
    pub async fn execute(&self, name: &str, args: serde_json::Value) -> Result<String, ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
        })?;

        let timeout = tool.timeout();
        info!(tool = %name, timeout_secs = timeout.as_secs(), "Executing tool");

        match tokio::time::timeout(timeout, tool.call(args)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                name: name.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }
}

/// Date and time tools: read the clock and set alarms.
///
/// Alarms are only recorded; nothing fires.
#[derive(Debug, Clone, Default)]
pub struct DateTimeTools {
    alarms: Arc<Mutex<Vec<DateTime<FixedOffset>>>>,
}

impl DateTimeTools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Alarms set so far, in the order they were requested.
    pub fn alarms(&self) -> Vec<DateTime<FixedOffset>> {
        self.alarms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn callbacks(&self) -> Vec<Arc<dyn ToolCallback>> {
        vec![
            Arc::new(CurrentDateTime),
            Arc::new(SetAlarm {
                alarms: Arc::clone(&self.alarms),
            }),
        ]
    }
}

struct CurrentDateTime;

#[async_trait]
impl ToolCallback for CurrentDateTime {
    fn name(&self) -> &str {
        "current_date_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time in the user's timezone"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    async fn call(&self, _args: serde_json::Value) -> Result<String, ToolError> {
        Ok(Local::now().to_rfc3339())
    }
}

struct SetAlarm {
    alarms: Arc<Mutex<Vec<DateTime<FixedOffset>>>>,
}

impl SetAlarm {
    /// RFC 3339, or a local date-time without offset.
    fn parse_time(raw: &str) -> Option<DateTime<FixedOffset>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt);
        }
        let naive = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.fixed_offset())
    }
}

#[async_trait]
impl ToolCallback for SetAlarm {
    fn name(&self) -> &str {
        "set_alarm"
    }

    fn description(&self) -> &str {
        "Set a user alarm for the given time, provided in ISO-8601 format"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "time": {
                    "type": "string",
                    "description": "Alarm time in ISO-8601 format"
                }
            },
            "required": ["time"]
        })
    }

    async fn call(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let raw = args["time"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments {
                name: self.name().to_string(),
                reason: "missing 'time' parameter".to_string(),
            })?;
        let time = Self::parse_time(raw.trim()).ok_or_else(|| ToolError::InvalidArguments {
            name: self.name().to_string(),
            reason: format!("'{}' is not an ISO-8601 date-time", raw),
        })?;

        self.alarms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(time);
        info!(time = %time, "Alarm set");
        Ok(format!("Alarm set for {}", time.to_rfc3339()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowTool;

    #[async_trait]
    impl ToolCallback for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "A tool that takes forever"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }

        async fn call(&self, _args: serde_json::Value) -> Result<String, ToolError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("done".into())
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(20)
        }
    }

    fn registry() -> (ToolRegistry, DateTimeTools) {
        let tools = DateTimeTools::new();
        let mut registry = ToolRegistry::new();
        registry.register_all(tools.callbacks()).unwrap();
        (registry, tools)
    }

    #[test]
    fn test_register_and_list() {
        let (mut registry, tools) = registry();
        assert_eq!(registry.names(), vec!["current_date_time", "set_alarm"]);
        assert_eq!(registry.definitions()[1].parameters["required"][0], "time");
        let dup = registry.register(tools.callbacks().remove(0));
        assert!(matches!(dup, Err(ToolError::AlreadyRegistered { .. })));
        registry.unregister("set_alarm").unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister("set_alarm").is_err());
    }

    #[tokio::test]
    async fn test_current_date_time_parses() {
        let (registry, _) = registry();
        let out = registry
            .execute("current_date_time", serde_json::json!({}))
            .await
            .unwrap();
        assert!(DateTime::parse_from_rfc3339(&out).is_ok());
    }

    #[tokio::test]
    async fn test_set_alarm_records_time() {
        let (registry, tools) = registry();
        let out = registry
            .execute(
                "set_alarm",
                serde_json::json!({"time": "2026-03-01T07:30:00+01:00"}),
            )
            .await
            .unwrap();
        assert!(out.starts_with("Alarm set for 2026-03-01T07:30:00+01:00"));
        assert_eq!(tools.alarms().len(), 1);

        registry
            .execute("set_alarm", serde_json::json!({"time": "2026-03-01T08:00"}))
            .await
            .unwrap();
        assert_eq!(tools.alarms().len(), 2);
    }

    #[tokio::test]
    async fn test_set_alarm_rejects_bad_input() {
        let (registry, tools) = registry();
        let missing = registry.execute("set_alarm", serde_json::json!({})).await;
        assert!(matches!(missing, Err(ToolError::InvalidArguments { .. })));
        let garbage = registry
            .execute("set_alarm", serde_json::json!({"time": "tomorrow-ish"}))
            .await;
        assert!(matches!(garbage, Err(ToolError::InvalidArguments { .. })));
        assert!(tools.alarms().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tool_and_timeout() {
        let (mut registry, _) = registry();
        let err = registry.execute("nope", serde_json::json!({})).await;
        assert!(matches!(err, Err(ToolError::NotFound { .. })));

        registry.register(Arc::new(SlowTool)).unwrap();
        let err = registry.execute("slow", serde_json::json!({})).await;
        assert!(matches!(err, Err(ToolError::Timeout { .. })));
    }
}
