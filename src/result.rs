use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The fixed taxonomy every failed execution is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Syntax,
    Runtime,
    Timeout,
    Memory,
    Permission,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Syntax => "Syntax",
            ErrorKind::Runtime => "Runtime",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Memory => "Memory",
            ErrorKind::Permission => "Permission",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
            column: None,
            stack: None,
        }
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Syntax, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    pub fn memory(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Memory, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, message)
    }

    /// Timeout error naming the configured budget.
    pub fn timeout(limit_ms: u64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("execution exceeded the configured timeout of {} ms", limit_ms),
        )
    }

    /// Attach a source position. Zero values mean "unknown" and are dropped.
    pub fn at(mut self, line: Option<usize>, column: Option<usize>) -> Self {
        self.line = line.filter(|l| *l > 0);
        self.column = column.filter(|c| *c > 0);
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        let stack = stack.into();
        if !stack.is_empty() {
            self.stack = Some(stack);
        }
        self
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)?;
        if let Some(line) = self.line {
            write!(f, " (line {}", line)?;
            if let Some(column) = self.column {
                write!(f, ", column {}", column)?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

/// Non-fatal diagnostic attached to a result or a validation report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
}

impl Warning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            column: None,
        }
    }

    pub fn at(mut self, line: usize, column: usize) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

/// Outcome of one `execute` call. Produced fresh per call and never mutated
/// afterwards; callers branch on `success`, not on `result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub result: Value,
    pub execution_time_ms: f64,
    /// Peak RSS growth of the worker in process isolation. In thread
    /// isolation it is the whole host process's RSS delta, so sandboxes
    /// running at the same time inflate each other's readings.
    #[serde(rename = "memoryUsedMB")]
    pub memory_used_mb: f64,
    pub output: String,
    pub errors: Vec<ExecutionError>,
    pub warnings: Vec<Warning>,
}

impl ExecutionResult {
    pub(crate) fn completed(
        result: Value,
        execution_time_ms: f64,
        memory_used_mb: f64,
        output: String,
        warnings: Vec<Warning>,
    ) -> Self {
        Self {
            success: true,
            result,
            execution_time_ms,
            memory_used_mb,
            output,
            errors: Vec::new(),
            warnings,
        }
    }

    pub(crate) fn failed(
        error: ExecutionError,
        execution_time_ms: f64,
        memory_used_mb: f64,
        output: String,
        warnings: Vec<Warning>,
    ) -> Self {
        Self {
            success: false,
            result: Value::Null,
            execution_time_ms,
            memory_used_mb,
            output,
            errors: vec![error],
            warnings,
        }
    }

    /// The single failure cause of a failed execution.
    pub fn primary_error(&self) -> Option<&ExecutionError> {
        self.errors.first()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.primary_error().map(|e| e.kind)
    }
}

/// Static report produced by `validate`; no code is evaluated to build it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ExecutionError>,
    pub warnings: Vec<Warning>,
    pub suggestions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_timeout_message_names_limit() {
        let err = ExecutionError::timeout(50);
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.message.contains("50 ms"));
    }

    #[test]
    fn test_zero_positions_are_dropped() {
        let err = ExecutionError::syntax("bad").at(Some(0), Some(0));
        assert_eq!(err.line, None);
        assert_eq!(err.column, None);

        let err = ExecutionError::syntax("bad").at(Some(3), Some(7));
        assert_eq!(err.to_string(), "Syntax error: bad (line 3, column 7)");
    }

    #[test]
    fn test_failed_result_shape() {
        let result = ExecutionResult::failed(
            ExecutionError::runtime("boom"),
            1.5,
            0.0,
            String::new(),
            Vec::new(),
        );
        assert!(!result.success);
        assert_eq!(result.result, Value::Null);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.error_kind(), Some(ErrorKind::Runtime));
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let result =
            ExecutionResult::completed(json!(2), 3.0, 0.5, "hi\n".to_string(), Vec::new());
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["executionTimeMs"], json!(3.0));
        assert_eq!(value["memoryUsedMB"], json!(0.5));
        assert_eq!(value["errors"], json!([]));
    }
}
