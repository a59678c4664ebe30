//! Pull analysis code out of a model response

use regex::Regex;
use std::sync::OnceLock;

fn lua_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[ \t]*lua[ \t]*\r?\n(.*?)```").unwrap())
}

fn any_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[ \t]*[A-Za-z0-9_+-]*[ \t]*\r?\n?(.*?)```").unwrap())
}

fn code_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*(local\s+[A-Za-z_]\w*|result|chart_data)\s*=|df:[a-z_]+\(").unwrap()
    })
}

/// Extract code: a ```lua block, else any fenced block, else the whole
/// response when it looks like code. `None` when nothing qualifies.
pub fn extract_code(response: &str) -> Option<String> {
    let fenced = lua_fence()
        .captures(response)
        .or_else(|| any_fence().captures(response))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string());

    match fenced {
        Some(code) if !code.is_empty() => Some(code),
        Some(_) => None,
        None => {
            let trimmed = response.trim();
            if !trimmed.is_empty() && !trimmed.contains("```") && looks_like_code(trimmed) {
                Some(trimmed.to_string())
            } else {
                None
            }
        }
    }
}

/// Heuristic: assigns a script global or calls the frame, and has no prose lines
fn looks_like_code(text: &str) -> bool {
    if !code_line().is_match(text) {
        return false;
    }
    !text.lines().any(|line| {
        let line = line.trim();
        line.split_whitespace().count() > 6
            && line.ends_with('.')
            && !line.starts_with("--")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_lua_fence() {
        let response = "Here:\n```text\nnot this\n```\n```lua\nresult = #df\n```";
        assert_eq!(extract_code(response).unwrap(), "result = #df");
    }

    #[test]
    fn test_falls_back_to_any_fence() {
        assert_eq!(extract_code("```\nresult = 1\n```").unwrap(), "result = 1");
        assert_eq!(
            extract_code("```python\nresult = df.shape\n```").unwrap(),
            "result = df.shape"
        );
    }

    #[test]
    fn test_bare_code_shaped_response() {
        let response = "local n = #df\nresult = n";
        assert_eq!(extract_code(response).unwrap(), response);
    }

    #[test]
    fn test_prose_yields_none() {
        assert!(extract_code("I cannot answer that question about the data.").is_none());
        assert!(extract_code("").is_none());
        assert!(extract_code("```lua\n```").is_none());
    }

    #[test]
    fn test_prose_with_assignment_is_not_code() {
        let response = "result = 5\nThis is the number of rows that match your filter today.";
        assert!(extract_code(response).is_none());
    }
}
