use tollgate_core::{TollgateError, TollgateResult};

/// Render the code an agent runs in its sandbox.
///
/// The delegation request is embedded as a JSON document and echoed back as
/// the agent's structured output, so the sandbox round trip is observable end
/// to end. Agents with real tooling replace this with their own program.
pub fn render(language: &str, request: &serde_json::Value) -> TollgateResult<String> {
    let json = serde_json::to_string(request)?;
    match language {
        "python" | "py" => {
            // A JSON string literal is also a valid Python string literal.
            let literal = serde_json::to_string(&json)?;
            Ok(format!(
                "import json\n\
                 request = json.loads({literal})\n\
                 print(json.dumps({{\"agent_id\": request[\"agent_id\"], \
                 \"session_id\": request[\"session_id\"], \
                 \"query\": request[\"query\"], \
                 \"context\": request[\"context\"], \
                 \"status\": \"handled\"}}))\n"
            ))
        }
        "javascript" | "js" | "node" => {
            let literal = serde_json::to_string(&json)?;
            Ok(format!(
                "const request = JSON.parse({literal});\n\
                 console.log(JSON.stringify({{agent_id: request.agent_id, \
                 session_id: request.session_id, query: request.query, \
                 context: request.context, status: \"handled\"}}));\n"
            ))
        }
        "shell" | "sh" | "bash" => Ok(format!("printf '%s\\n' {}\n", shell_quote(&json))),
        other => Err(TollgateError::Validation(format!(
            "no snippet template for language {other:?}"
        ))),
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> serde_json::Value {
        json!({
            "agent_id": "research",
            "session_id": "s1",
            "query": "it's \"quoted\"\nand multi-line",
            "context": {"recent": []},
        })
    }

    #[test]
    fn test_python_embeds_escaped_literal() {
        let code = render("python", &request()).unwrap();
        assert!(code.starts_with("import json\n"));
        assert!(code.contains(r#"\"agent_id\":\"research\""#));
        assert!(!code.contains("multi-line\"\n"));
    }

    #[test]
    fn test_shell_quotes_single_quotes() {
        let code = render("shell", &request()).unwrap();
        assert!(code.contains(r"it'\''s"));
    }

    #[test]
    fn test_unknown_language() {
        assert!(render("cobol", &request()).is_err());
    }
}
