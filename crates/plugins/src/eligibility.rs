//! Host requirement checks for hooks.

use {serde::Serialize, serde_json::Value};

use crate::hooks::HookRequirements;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Eligibility {
    pub eligible: bool,
    /// Unmet requirements, as `bin:<name>`, `env:<VAR>`, `config:<path>` or
    /// `os:<list>`.
    pub missing: Vec<String>,
}

/// What the host offers. Abstracted so checks are testable without touching
/// the process environment.
pub trait Host: Send + Sync {
    fn has_bin(&self, name: &str) -> bool;
    fn env(&self, name: &str) -> Option<String>;
    fn os(&self) -> &str;
}

pub struct SystemHost;

impl Host for SystemHost {
    fn has_bin(&self, name: &str) -> bool {
        which::which(name).is_ok()
    }

    fn env(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn os(&self) -> &str {
        std::env::consts::OS
    }
}

/// Check `req` against the running host and `config` (the serialized gateway
/// config).
pub fn check(req: &HookRequirements, config: &Value) -> Eligibility {
    check_with(req, config, &SystemHost)
}

pub fn check_with(req: &HookRequirements, config: &Value, host: &dyn Host) -> Eligibility {
    let mut missing = Vec::new();

    for bin in &req.bins {
        if !host.has_bin(bin) {
            missing.push(format!("bin:{bin}"));
        }
    }
    for var in &req.env {
        if host.env(var).is_none_or(|v| v.is_empty()) {
            missing.push(format!("env:{var}"));
        }
    }
    for path in &req.config {
        if !lookup(config, path).is_some_and(truthy) {
            missing.push(format!("config:{path}"));
        }
    }
    if !req.os.is_empty() && !req.os.iter().any(|os| os == host.os()) {
        missing.push(format!("os:{}", req.os.join(",")));
    }

    Eligibility {
        eligible: missing.is_empty(),
        missing,
    }
}

fn lookup<'a>(root: &'a Value, dotted: &str) -> Option<&'a Value> {
    dotted
        .split('.')
        .try_fold(root, |node, segment| node.as_object()?.get(segment))
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    struct FakeHost;

    impl Host for FakeHost {
        fn has_bin(&self, name: &str) -> bool {
            name == "jq"
        }

        fn env(&self, name: &str) -> Option<String> {
            match name {
                "SLACK_TOKEN" => Some("xoxb".into()),
                "EMPTY" => Some(String::new()),
                _ => None,
            }
        }

        fn os(&self) -> &str {
            "linux"
        }
    }

    #[test]
    fn all_requirements_met() {
        let req = HookRequirements {
            bins: vec!["jq".into()],
            env: vec!["SLACK_TOKEN".into()],
            config: vec!["hooks.notify_channel".into()],
            os: vec!["linux".into(), "macos".into()],
        };
        let config = json!({"hooks": {"notify_channel": "slack"}});
        let e = check_with(&req, &config, &FakeHost);
        assert!(e.eligible, "{:?}", e.missing);
    }

    #[test]
    fn reports_every_missing_requirement() {
        let req = HookRequirements {
            bins: vec!["ffmpeg".into()],
            env: vec!["EMPTY".into(), "UNSET".into()],
            config: vec!["hooks.notify_channel".into(), "gateway.port".into()],
            os: vec!["windows".into()],
        };
        let config = json!({"hooks": {"notify_channel": null}, "gateway": {"port": 18790}});
        let e = check_with(&req, &config, &FakeHost);
        assert!(!e.eligible);
        assert_eq!(e.missing, [
            "bin:ffmpeg",
            "env:EMPTY",
            "env:UNSET",
            "config:hooks.notify_channel",
            "os:windows",
        ]);
    }

    #[test]
    fn no_requirements_is_eligible() {
        assert!(check(&HookRequirements::default(), &Value::Null).eligible);
    }
}
