/// Replace `${ENV_VAR}` and `${ENV_VAR:-fallback}` placeholders in raw config
/// text.
///
/// Unresolvable variables without a fallback are left as-is.
pub fn substitute_env(input: &str) -> String {
    substitute_with(input, |name| std::env::var(name).ok())
}

fn substitute_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || chars.peek() != Some(&'{') {
            result.push(ch);
            continue;
        }
        chars.next(); // consume '{'

        let mut body = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == '}' {
                closed = true;
                break;
            }
            body.push(c);
        }

        if !closed || body.is_empty() {
            // Malformed, emit literal.
            result.push_str("${");
            result.push_str(&body);
            continue;
        }

        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body.as_str(), None),
        };
        match (lookup(name), fallback) {
            (Some(val), _) => result.push_str(&val),
            (None, Some(fallback)) => result.push_str(fallback),
            (None, None) => {
                result.push_str("${");
                result.push_str(&body);
                result.push('}');
            },
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake(name: &str) -> Option<String> {
        (name == "TRADECLAW_TEST_TOKEN").then(|| "s3cret".to_string())
    }

    #[test]
    fn substitutes_known_var() {
        assert_eq!(
            substitute_with("token = \"${TRADECLAW_TEST_TOKEN}\"", fake),
            "token = \"s3cret\""
        );
    }

    #[test]
    fn reads_process_environment() {
        if let Ok(path) = std::env::var("PATH") {
            assert_eq!(substitute_env("${PATH}"), path);
        }
    }

    #[test]
    fn fallback_used_when_unset() {
        assert_eq!(substitute_with("${NOPE:-8080}", fake), "8080");
        assert_eq!(substitute_with("${TRADECLAW_TEST_TOKEN:-x}", fake), "s3cret");
    }

    #[test]
    fn leaves_unknown_var() {
        assert_eq!(substitute_with("${NOPE}", fake), "${NOPE}");
    }

    #[test]
    fn malformed_placeholder_is_literal() {
        assert_eq!(substitute_with("a ${OPEN", fake), "a ${OPEN");
        assert_eq!(substitute_with("plain $ text", fake), "plain $ text");
    }
}
