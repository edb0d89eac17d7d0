//! Errors that tell the user what to do next.

use std::fmt;
use std::path::Path;

/// An error with context and suggestions.
#[derive(Debug)]
pub struct HelpfulError {
    pub message: String,
    pub context: Option<String>,
    pub suggestions: Vec<String>,
}

impl HelpfulError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: None,
            suggestions: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_suggestions(
        mut self,
        suggestions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.suggestions
            .extend(suggestions.into_iter().map(|s| s.into()));
        self
    }

    /// The sink file is locked by another ebbflow process.
    pub fn sink_busy(path: &Path, details: &str) -> Self {
        Self::new(format!("Cannot open sink: {}", path.display()))
            .with_context(details.to_string())
            .with_suggestions([
                "TRY: Wait for the other ebbflow run to finish".to_string(),
                "TRY: Point this run at another file with --sink".to_string(),
            ])
    }

    /// A key argument did not parse for the source's key kind.
    pub fn invalid_key(value: &str, kind: &str) -> Self {
        Self::new(format!("Invalid {} key: '{}'", kind, value)).with_suggestions([
            "TRY: Dates look like 2024-01-31".to_string(),
            "TRY: Integer keys look like 120".to_string(),
        ])
    }

    /// A downstream hook exited unsuccessfully.
    pub fn hook_failed(command: &str, details: &str) -> Self {
        Self::new(format!("Downstream command failed: {}", command))
            .with_context(details.to_string())
            .with_suggestion("TRY: Run the command by hand with the EBBFLOW_* variables set")
    }
}

impl fmt::Display for HelpfulError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ERROR: {}", self.message)?;

        if let Some(ctx) = &self.context {
            writeln!(f, "CONTEXT: {}", ctx)?;
        }

        if !self.suggestions.is_empty() {
            writeln!(f)?;
            for suggestion in &self.suggestions {
                writeln!(f, "  {}", suggestion)?;
            }
        }

        Ok(())
    }
}

impl std::error::Error for HelpfulError {}

/// Print an error as a JSON object on stdout, for `--json` callers.
pub fn print_json_error(err: &anyhow::Error) {
    let value = match err.downcast_ref::<HelpfulError>() {
        Some(helpful) => serde_json::json!({
            "error": helpful.message,
            "context": helpful.context,
            "suggestions": helpful.suggestions,
        }),
        None => serde_json::json!({
            "error": format!("{:#}", err),
        }),
    };
    println!("{}", value);
}
