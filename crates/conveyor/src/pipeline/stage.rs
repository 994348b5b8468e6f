//! Pipeline stage definition

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::task::Task;
use crate::worker::runtime::Handler;

/// Stage sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage name, used in logs and worker ids
    pub name: String,

    /// Number of concurrent workers in the stage
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Capacity of the stage's input queue
    #[serde(default = "default_input_capacity")]
    pub input_capacity: usize,
}

fn default_concurrency() -> usize {
    1
}

fn default_input_capacity() -> usize {
    16
}

impl StageConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: default_concurrency(),
            input_capacity: default_input_capacity(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_input_capacity(mut self, capacity: usize) -> Self {
        self.input_capacity = capacity.max(1);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "stage name must not be empty".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "stage '{}': concurrency must be at least 1",
                self.name
            )));
        }
        if self.input_capacity == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "stage '{}': input_capacity must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

/// One transformation step of a [`Pipeline`](super::Pipeline)
///
/// The transform receives the payload only; the task id is carried through
/// the pipeline unchanged.
pub struct Stage<I, O> {
    pub(crate) config: StageConfig,
    pub(crate) handler: Handler<I, O>,
}

impl<I, O> Stage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Create a stage from its name, worker count and input capacity
    pub fn new<F, Fut>(
        name: impl Into<String>,
        concurrency: usize,
        input_capacity: usize,
        transform: F,
    ) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let config = StageConfig {
            name: name.into(),
            concurrency,
            input_capacity,
        };
        Self::from_config(config, transform)
    }

    pub fn from_config<F, Fut>(config: StageConfig, transform: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let handler: Handler<I, O> =
            Arc::new(move |task: Task<I>| transform(task.into_payload()).boxed());
        Self { config, handler }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }
}

impl<I, O> fmt::Debug for Stage<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_config_defaults() {
        let config: StageConfig = serde_json::from_str(r#"{"name":"parse"}"#).unwrap();
        assert_eq!(config, StageConfig::new("parse"));
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.input_capacity, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stage_config_validation() {
        let config = StageConfig {
            name: "resize".into(),
            concurrency: 0,
            input_capacity: 4,
        };
        let err = config.validate().unwrap_err();
        assert_eq!(
            err,
            EngineError::InvalidConfig("stage 'resize': concurrency must be at least 1".into())
        );

        assert!(StageConfig::new("").validate().is_err());
        assert_eq!(
            StageConfig::new("x").with_concurrency(0).with_input_capacity(0),
            StageConfig {
                name: "x".into(),
                concurrency: 1,
                input_capacity: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_transform_receives_payload() {
        let stage = Stage::new("len", 2, 8, |s: String| async move { Ok(s.len()) });
        assert_eq!(stage.name(), "len");
        assert_eq!(stage.config().concurrency, 2);

        let output = (stage.handler)(Task::new("four".to_string())).await.unwrap();
        assert_eq!(output, 4);
    }
}
