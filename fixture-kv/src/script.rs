//! KV init scripts: one write command per line, `#` starts a comment.
//!
//! ```text
//! # users
//! SET user:1 ada lovelace
//! SET user:2 grace
//! DEL user:2
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::protocol::Request;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("failed to read {}: {message}", .path.display())]
    Read { path: PathBuf, message: String },
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
}

pub fn parse_script(content: &str) -> Result<Vec<Request>, ScriptError> {
    let mut requests = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let syntax = |message: String| ScriptError::Syntax {
            line: index + 1,
            message,
        };
        let request = Request::parse(line).map_err(syntax)?;
        if !request.is_write() {
            return Err(syntax(format!("'{}' is not allowed in an init script", request)));
        }
        requests.push(request);
    }
    Ok(requests)
}

pub fn load_script(path: &Path) -> Result<Vec<Request>, ScriptError> {
    let content = fs::read_to_string(path).map_err(|e| ScriptError::Read {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    parse_script(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_script_skips_comments() {
        let requests = parse_script("# seed\n\nSET a 1\n  SET b two words\nDEL a\n").unwrap();
        assert_eq!(
            requests,
            vec![
                Request::Set("a".into(), "1".into()),
                Request::Set("b".into(), "two words".into()),
                Request::Del("a".into()),
            ]
        );
    }

    #[test]
    fn test_malformed_line_reports_line_number() {
        let err = parse_script("SET a 1\nINSERT b 2\n").unwrap_err();
        assert_eq!(
            err,
            ScriptError::Syntax {
                line: 2,
                message: "unknown command 'INSERT'".into()
            }
        );
    }

    #[test]
    fn test_reads_are_rejected() {
        let err = parse_script("GET a").unwrap_err();
        assert!(err.to_string().starts_with("line 1:"));
    }

    #[test]
    fn test_missing_file() {
        let err = load_script(Path::new("/nonexistent/seed.kv")).unwrap_err();
        assert!(matches!(err, ScriptError::Read { .. }));
    }
}
