// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Builders: merge the three specs and validate the result for one
//! (runtime, task) pair.

use crate::error::{Error, Result};

use super::{FunctionSpec, RunSpec, TaskSpec};

/// Turns a function, task and run request into the effective run spec.
///
/// Runs once, synchronously, when the run is created. The result is stored
/// on the run and never rebuilt.
pub trait Builder: Send + Sync {
    /// Produce the effective spec.
    fn build(&self, function: &FunctionSpec, task: &TaskSpec, run: RunSpec) -> Result<RunSpec>;
}

/// What an effective spec must carry to be runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Nothing beyond the task kind.
    None,
    /// Source code or a prebuilt image.
    SourceOrImage,
    /// Source code.
    Source,
    /// An image.
    Image,
    /// A workflow definition.
    Workflow,
}

/// Default builder: field-by-field merge, then a requirement check.
#[derive(Debug, Clone)]
pub struct ValidatingBuilder {
    runtime: String,
    task: String,
    requirement: Requirement,
}

impl ValidatingBuilder {
    /// Builder for `runtime`+`task` enforcing `requirement`.
    pub fn new(runtime: impl Into<String>, task: impl Into<String>, requirement: Requirement) -> Self {
        Self {
            runtime: runtime.into(),
            task: task.into(),
            requirement,
        }
    }

    fn invalid(&self, what: &str) -> Error {
        Error::InvalidSpec(format!("{}+{} requires {}", self.runtime, self.task, what))
    }
}

impl Builder for ValidatingBuilder {
    fn build(&self, function: &FunctionSpec, task: &TaskSpec, run: RunSpec) -> Result<RunSpec> {
        if run.task != self.task {
            return Err(Error::InvalidSpec(format!(
                "run requests task {} but builder handles {}",
                run.task, self.task
            )));
        }

        let spec = RunSpec::merge(function, task, run);

        let satisfied = match self.requirement {
            Requirement::None => true,
            Requirement::SourceOrImage => spec.source.is_some() || spec.image.is_some(),
            Requirement::Source => spec.source.is_some(),
            Requirement::Image => spec.image.is_some(),
            Requirement::Workflow => spec.workflow.is_some(),
        };
        if !satisfied {
            return Err(self.invalid(match self.requirement {
                Requirement::SourceOrImage => "source or image",
                Requirement::Source => "source",
                Requirement::Image => "image",
                Requirement::Workflow => "workflow",
                Requirement::None => "nothing",
            }));
        }

        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_image_rejected() {
        let builder = ValidatingBuilder::new("container", "job", Requirement::Image);

        let err = builder
            .build(&FunctionSpec::default(), &TaskSpec::default(), RunSpec::new("job"))
            .unwrap_err();

        assert_eq!(err.error_code(), "INVALID_SPEC");
        assert!(err.to_string().contains("container+job requires image"));
    }

    #[test]
    fn test_image_from_function_satisfies() {
        let builder = ValidatingBuilder::new("container", "job", Requirement::Image);
        let function = FunctionSpec {
            image: Some("busybox".into()),
            ..FunctionSpec::default()
        };

        let spec = builder
            .build(&function, &TaskSpec::default(), RunSpec::new("job"))
            .unwrap();

        assert_eq!(spec.image.as_deref(), Some("busybox"));
    }

    #[test]
    fn test_task_kind_mismatch_rejected() {
        let builder = ValidatingBuilder::new("python", "build", Requirement::Source);

        let err = builder
            .build(&FunctionSpec::default(), &TaskSpec::default(), RunSpec::new("job"))
            .unwrap_err();

        assert!(err.to_string().contains("builder handles build"));
    }
}
