//! Typed access to a task's positional and keyword arguments.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("missing argument `{0}`")]
    Missing(String),

    #[error("invalid argument `{name}`: {source}")]
    Invalid {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Arguments handed to a handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPayload {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskPayload {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Positional argument at `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, PayloadError> {
        let value = self
            .args
            .get(index)
            .ok_or_else(|| PayloadError::Missing(format!("#{index}")))?;
        decode(&format!("#{index}"), value)
    }

    /// Keyword argument `name`.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<T, PayloadError> {
        let value = self
            .kwargs
            .get(name)
            .ok_or_else(|| PayloadError::Missing(name.to_string()))?;
        decode(name, value)
    }

    /// Keyword argument `name`, or `default` when absent.
    pub fn kwarg_or<T: DeserializeOwned>(&self, name: &str, default: T) -> Result<T, PayloadError> {
        match self.kwargs.get(name) {
            Some(value) => decode(name, value),
            None => Ok(default),
        }
    }

    /// A parameter that may be passed by keyword or at `position`.
    /// The keyword wins when both are present.
    pub fn param<T: DeserializeOwned>(&self, position: usize, name: &str) -> Result<T, PayloadError> {
        match self.kwargs.get(name).or_else(|| self.args.get(position)) {
            Some(value) => decode(name, value),
            None => Err(PayloadError::Missing(name.to_string())),
        }
    }

    /// Like [`param`](Self::param), falling back to `default` when absent.
    pub fn param_or<T: DeserializeOwned>(
        &self,
        position: usize,
        name: &str,
        default: T,
    ) -> Result<T, PayloadError> {
        match self.param(position, name) {
            Err(PayloadError::Missing(_)) => Ok(default),
            other => other,
        }
    }
}

fn decode<T: DeserializeOwned>(name: &str, value: &Value) -> Result<T, PayloadError> {
    serde_json::from_value(value.clone()).map_err(|source| PayloadError::Invalid {
        name: name.to_string(),
        source,
    })
}
