//! Code search over the workspace with `grep`.

use regex::Regex;
use serde_json::{Value, json};

use crate::core::path::relative_dir_path;
use crate::environment::Environment;
use crate::tools::{Tool, ToolError, ToolOutput, optional_str, optional_u64, required_str, shell_quote};

const DEFAULT_MAX_RESULTS: u64 = 100;

pub struct SearchCode;

impl Tool for SearchCode {
    fn name(&self) -> &str {
        "search_code"
    }

    fn description(&self) -> &str {
        "Search workspace files for a pattern. Returns matching lines as path:line:text. \
         Set regex=true for a POSIX extended regular expression (as in grep -E: no \\d, \
         no (?i) flags, no lazy quantifiers; use [0-9] and [[:space:]]); otherwise the \
         pattern is a fixed string."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "minLength": 1 },
                "path": { "type": "string", "description": "Directory to search; defaults to the workspace root" },
                "regex": { "type": "boolean" },
                "max_results": { "type": "integer", "minimum": 1, "maximum": 1000 }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    fn call(&self, env: &dyn Environment, args: &Value) -> Result<ToolOutput, ToolError> {
        let pattern = required_str(args, "pattern")?;
        let is_regex = args.get("regex").and_then(Value::as_bool).unwrap_or(false);
        if is_regex {
            Regex::new(pattern)
                .map_err(|e| ToolError::InvalidArguments(format!("invalid regex: {e}")))?;
            if let Some(problem) = ere_unsupported(pattern) {
                return Err(ToolError::InvalidArguments(format!(
                    "unsupported in extended regular expressions: {problem}"
                )));
            }
        }
        let dir = relative_dir_path(optional_str(args, "path").unwrap_or("."))
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let max_results = optional_u64(args, "max_results").unwrap_or(DEFAULT_MAX_RESULTS) as usize;

        let target = if dir.is_empty() {
            ".".to_string()
        } else {
            shell_quote(&dir)
        };
        let mode = if is_regex { "-E" } else { "-F" };
        let command = format!(
            "grep -rnI --exclude-dir=.git --exclude-dir=node_modules {mode} -e {} -- {target}",
            shell_quote(pattern)
        );
        let out = env.exec(&command, None)?;
        match out.exit_code {
            0 => {}
            1 => return Ok(ToolOutput::Text(format!("No matches for {pattern:?}"))),
            code => {
                return Err(ToolError::Failed(format!(
                    "search failed (exit {code}): {}",
                    out.stderr.trim()
                )));
            }
        }

        let lines: Vec<&str> = out
            .stdout
            .lines()
            .map(|line| line.strip_prefix("./").unwrap_or(line))
            .collect();
        let total = lines.len();
        let mut text = lines
            .into_iter()
            .take(max_results)
            .collect::<Vec<_>>()
            .join("\n");
        if total > max_results {
            text.push_str(&format!("\n[{} more matches omitted]", total - max_results));
        }
        Ok(ToolOutput::Text(text))
    }
}

/// First construct that `regex` accepts but `grep -E` would read differently.
fn ere_unsupported(pattern: &str) -> Option<String> {
    let mut chars = pattern.chars().peekable();
    let mut prev: Option<char> = None;
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next()
                    && matches!(next, 'd' | 'D' | 'p' | 'P' | 'A' | 'z' | 'h' | 'H' | 'x' | 'u')
                {
                    return Some(format!("\\{next}"));
                }
                prev = None;
                continue;
            }
            '[' => {
                // Bracket expressions are literal up to the closing `]`; a
                // leading `]` (after an optional `^`) is part of the set.
                chars.next_if_eq(&'^');
                chars.next_if_eq(&']');
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                }
            }
            '(' if chars.peek() == Some(&'?') => return Some("(?...) groups and flags".to_string()),
            '?' if matches!(prev, Some('*' | '+' | '?' | '}')) => {
                return Some("lazy quantifiers".to_string());
            }
            _ => {}
        }
        prev = Some(c);
    }
    None
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test_support::host_env;

    #[test]
    fn finds_fixed_strings_with_paths_and_line_numbers() {
        let (temp, env) = host_env();
        fs::create_dir_all(temp.path().join("src")).expect("mkdir");
        fs::write(temp.path().join("src/a.ts"), "let x = 1;\nfoo(x);\n").expect("write");
        let text = SearchCode
            .call(&env, &json!({"pattern": "foo("}))
            .expect("search")
            .into_content();
        assert_eq!(text, "src/a.ts:2:foo(x);");
    }

    #[test]
    fn no_matches_is_not_an_error() {
        let (_temp, env) = host_env();
        let text = SearchCode
            .call(&env, &json!({"pattern": "absent"}))
            .expect("search")
            .into_content();
        assert!(text.starts_with("No matches"));
    }

    #[test]
    fn invalid_regex_is_rejected_before_running() {
        let (_temp, env) = host_env();
        let err = SearchCode
            .call(&env, &json!({"pattern": "(", "regex": true}))
            .err()
            .expect("invalid");
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn rust_only_regex_syntax_is_rejected() {
        let (_temp, env) = host_env();
        for pattern in [r"\d+", "(?i)foo", "a+?", r"\p{L}"] {
            let err = SearchCode
                .call(&env, &json!({"pattern": pattern, "regex": true}))
                .err()
                .expect("rejected");
            assert!(matches!(err, ToolError::InvalidArguments(_)), "{pattern}: {err}");
        }
    }

    #[test]
    fn extended_regex_matches_through_grep() {
        let (temp, env) = host_env();
        fs::write(temp.path().join("v.txt"), "version 12\nname x\n").expect("write");
        let text = SearchCode
            .call(&env, &json!({"pattern": "ver[a-z]+ [0-9]{2}$", "regex": true}))
            .expect("search")
            .into_content();
        assert_eq!(text, "v.txt:1:version 12");
        assert_eq!(ere_unsupported(r"[\d]x"), None);
        assert_eq!(ere_unsupported(r"a\.b?"), None);
    }

    #[test]
    fn results_are_capped() {
        let (temp, env) = host_env();
        fs::write(temp.path().join("many.txt"), "hit\n".repeat(5)).expect("write");
        let text = SearchCode
            .call(&env, &json!({"pattern": "hit", "max_results": 2}))
            .expect("search")
            .into_content();
        assert!(text.contains("[3 more matches omitted]"), "{text}");
    }
}
