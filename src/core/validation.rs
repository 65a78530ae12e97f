use crate::core::error::FlowError;

/// An issue found while validating a component tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    /// The definition cannot be executed as written.
    Error(String),
    /// The definition runs, but probably not the way its author expects.
    Warning(String),
}

/// The result of a validation pass over a definition.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.issues.push(ValidationIssue::Error(msg.into()));
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.issues.push(ValidationIssue::Warning(msg.into()));
    }

    /// Appends the issues of a nested validation pass.
    pub fn extend(&mut self, other: ValidationResult) {
        self.issues.extend(other.issues);
    }

    pub fn is_safe(&self) -> bool {
        !self.issues.iter().any(|i| matches!(i, ValidationIssue::Error(_)))
    }

    pub fn has_warnings(&self) -> bool {
        self.issues.iter().any(|i| matches!(i, ValidationIssue::Warning(_)))
    }

    pub fn errors(&self) -> impl Iterator<Item = &str> {
        self.issues.iter().filter_map(|issue| match issue {
            ValidationIssue::Error(msg) => Some(msg.as_str()),
            ValidationIssue::Warning(_) => None,
        })
    }

    /// Logs every issue at the matching level.
    pub fn log_summary(&self) {
        if self.is_safe() && !self.has_warnings() {
            log::debug!("Component validation passed.");
            return;
        }

        for issue in &self.issues {
            match issue {
                ValidationIssue::Error(msg) => log::error!("Validation error: {msg}"),
                ValidationIssue::Warning(msg) => log::warn!("Validation warning: {msg}"),
            }
        }
    }

    /// Converts error-level issues into a [`FlowError::Validation`]. Warnings are logged
    /// and otherwise ignored.
    pub fn into_result(self) -> Result<(), FlowError> {
        self.log_summary();
        if self.is_safe() {
            return Ok(());
        }
        Err(FlowError::Validation(self.errors().collect::<Vec<_>>().join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warnings_do_not_fail() {
        let mut result = ValidationResult::new();
        result.add_warning("parallel runs sequentially");
        assert!(result.is_safe());
        assert!(result.has_warnings());
        assert!(result.into_result().is_ok());
    }

    #[test]
    fn test_errors_are_joined() {
        let mut result = ValidationResult::new();
        result.add_error("duplicate id 'a'");
        result.add_error("invalid id 'b c'");
        let err = result.into_result().unwrap_err();
        assert_eq!(err.to_string(), "Validation error: duplicate id 'a'; invalid id 'b c'");
    }
}
