//! 工具输出合约
//!
//! stdout 的第一个非空行必须是 JSON 头对象：
//! `{"tokens_used": N, "created_files": [...], "modified_files": [...]}`，
//! 复查轮还可带 `follow_up_tasks`。其余行是自由说明文本，整体存入结果。
//! 头不合法一律 `Protocol` 错误，不做启发式解析。

use serde::Deserialize;

use crate::core::error::EngineError;
use crate::store::task::TaskPriority;

/// 复查轮产出的后续任务
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FollowUpSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
}

#[derive(Debug, Clone, Deserialize)]
struct OutputHeader {
    tokens_used: u64,
    #[serde(default)]
    created_files: Vec<String>,
    #[serde(default)]
    modified_files: Vec<String>,
    #[serde(default)]
    follow_up_tasks: Vec<FollowUpSpec>,
}

/// 解析后的调用结果
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerOutput {
    pub tokens_used: u64,
    pub created_files: Vec<String>,
    pub modified_files: Vec<String>,
    pub follow_up_tasks: Vec<FollowUpSpec>,
    /// 头之后的自由说明文本
    pub text: String,
}

/// 按合约解析原始 stdout
pub fn parse_output(raw: &str) -> Result<RunnerOutput, EngineError> {
    let mut lines = raw.lines();
    let header_line = loop {
        match lines.next() {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => break line,
            None => {
                return Err(EngineError::Protocol(
                    "empty output, expected JSON header line".to_string(),
                ));
            }
        }
    };

    let header: OutputHeader = serde_json::from_str(header_line.trim())
        .map_err(|e| EngineError::Protocol(format!("bad header line: {e}")))?;

    let text = lines.collect::<Vec<_>>().join("\n").trim().to_string();

    Ok(RunnerOutput {
        tokens_used: header.tokens_used,
        created_files: header.created_files,
        modified_files: header.modified_files,
        follow_up_tasks: header.follow_up_tasks,
        text,
    })
}

/// 组装一条合约输出（脚本化替身与测试用）
pub fn format_output(
    tokens_used: u64,
    created_files: &[&str],
    modified_files: &[&str],
    text: &str,
) -> String {
    let header = serde_json::json!({
        "tokens_used": tokens_used,
        "created_files": created_files,
        "modified_files": modified_files,
    });
    format!("{header}\n{text}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_header() {
        let raw = "{\"tokens_used\": 42}\nAll done.";
        let out = parse_output(raw).unwrap();
        assert_eq!(out.tokens_used, 42);
        assert!(out.created_files.is_empty());
        assert_eq!(out.text, "All done.");
    }

    #[test]
    fn test_parse_full_header_with_leading_blank_lines() {
        let raw = "\n\n{\"tokens_used\": 10, \"created_files\": [\"src/a.rs\"], \"modified_files\": [\"src/b.rs\"]}\nline one\nline two";
        let out = parse_output(raw).unwrap();
        assert_eq!(out.created_files, vec!["src/a.rs"]);
        assert_eq!(out.modified_files, vec!["src/b.rs"]);
        assert_eq!(out.text, "line one\nline two");
    }

    #[test]
    fn test_parse_follow_up_tasks() {
        let raw = r#"{"tokens_used": 5, "follow_up_tasks": [{"title": "Add tests", "description": "Cover the parser", "dependencies": ["t1"]}]}
Review complete."#;
        let out = parse_output(raw).unwrap();
        assert_eq!(out.follow_up_tasks.len(), 1);
        assert_eq!(out.follow_up_tasks[0].title, "Add tests");
        assert_eq!(out.follow_up_tasks[0].dependencies, vec!["t1"]);
    }

    #[test]
    fn test_missing_header_is_protocol_error() {
        let err = parse_output("I finished the task, great success!").unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[test]
    fn test_missing_tokens_field_is_protocol_error() {
        let err = parse_output("{\"created_files\": []}\ntext").unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[test]
    fn test_empty_output_is_protocol_error() {
        assert!(matches!(
            parse_output("\n\n").unwrap_err(),
            EngineError::Protocol(_)
        ));
    }

    #[test]
    fn test_format_round_trip() {
        let raw = format_output(77, &["x.rs"], &[], "done");
        let out = parse_output(&raw).unwrap();
        assert_eq!(out.tokens_used, 77);
        assert_eq!(out.created_files, vec!["x.rs"]);
        assert_eq!(out.text, "done");
    }
}
