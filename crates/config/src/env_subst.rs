/// Replace `${ENV_VAR}` and `${ENV_VAR:-default}` placeholders in raw config
/// text.
///
/// Unresolvable variables without a default are left as-is.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

/// Replace placeholders using a custom lookup function.
///
/// Split out from [`substitute_env`] so tests don't touch the process
/// environment.
pub fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut inner = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                inner.push(c);
            }
            if !closed || inner.is_empty() {
                // Malformed, emit literal.
                result.push_str("${");
                result.push_str(&inner);
                if closed {
                    result.push('}');
                }
                continue;
            }

            let (name, default) = match inner.split_once(":-") {
                Some((name, default)) => (name, Some(default)),
                None => (inner.as_str(), None),
            };
            match lookup(name).filter(|v| !v.is_empty()) {
                Some(val) => result.push_str(&val),
                None => match default {
                    Some(default) => result.push_str(default),
                    None => {
                        result.push_str("${");
                        result.push_str(&inner);
                        result.push('}');
                    },
                },
            }
        } else {
            result.push(ch);
        }
    }

    result
}
