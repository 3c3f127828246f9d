use serde::{Deserialize, Serialize};
use std::path::Path;

/// Query parameters accepted by the log endpoints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogQuery {
    /// Keep only the last N lines
    pub tail: Option<usize>,
    /// Return the lines after index N
    pub cursor: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogSlice {
    pub result: String,
    /// Line count of the whole log, to be passed back as the next cursor
    pub cursor: usize,
}

/// Cut `text` down according to `query`; `tail` wins over `cursor`
pub fn slice_log(text: &str, query: &LogQuery) -> LogSlice {
    let cursor = text.matches('\n').count();
    let lines: Vec<&str> = text.split('\n').collect();

    let result = match (query.tail, query.cursor) {
        (Some(tail), _) if lines.len() > tail => lines[lines.len() - tail..].join("\n"),
        (None, Some(after)) if lines.len() > after => lines[after..].join("\n"),
        _ => text.to_string(),
    };

    LogSlice { result, cursor }
}

/// Read and slice a log file; a missing file reads as empty
pub async fn read_log(path: &Path, query: &LogQuery) -> std::io::Result<LogSlice> {
    let text = match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };
    Ok(slice_log(&text, query))
}
