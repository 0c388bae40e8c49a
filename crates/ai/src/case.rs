use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_MODULE: &str = "default";
pub const UNNAMED_CASE: &str = "unnamed case";
pub const DEFAULT_LEVEL: &str = "P2";
pub const READY: &str = "ready";

/// A generated test case, ready to be persisted by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub project: String,
    pub module: String,
    pub name: String,
    /// Priority level, `P0`..`P3`
    pub level: String,
    pub status: String,
    /// The raw model output for this case, as JSON text
    pub content: String,
}

impl TestCase {
    /// Shape one raw model case.
    ///
    /// The caller's `module` wins over the module the model picked; missing
    /// fields get defaults.
    pub fn from_model_value(project: &str, module: Option<&str>, raw: &Value) -> Self {
        let module = module
            .filter(|m| !m.trim().is_empty())
            .or_else(|| str_field(raw, "module"))
            .unwrap_or(DEFAULT_MODULE);

        Self {
            project: project.to_string(),
            module: module.to_string(),
            name: str_field(raw, "name").unwrap_or(UNNAMED_CASE).to_string(),
            level: str_field(raw, "level").unwrap_or(DEFAULT_LEVEL).to_string(),
            status: READY.to_string(),
            content: raw.to_string(),
        }
    }
}

fn str_field<'a>(raw: &'a Value, key: &str) -> Option<&'a str> {
    raw.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn caller_module_overrides_model_module() {
        let raw = json!({"module": "login", "name": "valid password", "level": "P1"});
        let case = TestCase::from_model_value("Acme", Some("checkout"), &raw);

        assert_eq!(case.project, "Acme");
        assert_eq!(case.module, "checkout");
        assert_eq!(case.name, "valid password");
        assert_eq!(case.level, "P1");
        assert_eq!(case.status, READY);
        assert_eq!(serde_json::from_str::<Value>(&case.content).unwrap(), raw);
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let case = TestCase::from_model_value("Acme", None, &json!({"steps": ["open app"]}));

        assert_eq!(case.module, DEFAULT_MODULE);
        assert_eq!(case.name, UNNAMED_CASE);
        assert_eq!(case.level, DEFAULT_LEVEL);
    }

    #[test]
    fn model_module_used_when_caller_gives_none() {
        let case = TestCase::from_model_value("Acme", Some(""), &json!({"module": "search"}));
        assert_eq!(case.module, "search");
    }
}
