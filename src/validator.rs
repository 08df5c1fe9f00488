//! Per-type data/meta schema validation (spec.md §4.4).
//!
//! The store is validator-library-agnostic: a [`Validator`] is any type
//! that can judge a [`serde_json::Value`] and report field errors. This
//! mirrors the teacher's pattern of boxed trait objects behind a
//! `type -> handler` registry (see [`crate::projector::Projector`] and
//! [`crate::contextor::Contextor`], which use the same shape for their
//! own per-type handler tables).

use std::collections::HashMap;

use crate::error::{EventParserError, FieldError};

/// Validates a single JSON value, returning field-level errors on failure.
pub trait Validator: Send + Sync {
    fn validate(&self, value: &serde_json::Value) -> Vec<FieldError>;
}

impl<F> Validator for F
where
    F: Fn(&serde_json::Value) -> Vec<FieldError> + Send + Sync,
{
    fn validate(&self, value: &serde_json::Value) -> Vec<FieldError> {
        self(value)
    }
}

#[derive(Default)]
struct Schemas {
    data: Option<Box<dyn Validator>>,
    meta: Option<Box<dyn Validator>>,
}

/// Registry mapping event `type -> {data_schema?, meta_schema?}`.
#[derive(Default)]
pub struct Registry {
    types: HashMap<String, Schemas>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an event type along with its optional data/meta
    /// validators. Per spec.md §5, callers must not invoke this
    /// concurrently with `push`/`validate`.
    pub fn register(
        &mut self,
        r#type: impl Into<String>,
        data: Option<Box<dyn Validator>>,
        meta: Option<Box<dyn Validator>>,
    ) {
        self.types.insert(r#type.into(), Schemas { data, meta });
    }

    pub fn is_registered(&self, r#type: &str) -> bool {
        self.types.contains_key(r#type)
    }

    /// Runs the registered data/meta schemas against a candidate record's
    /// payload and envelope. An unregistered type is not this method's
    /// concern: `Store::push` checks registration before calling here.
    pub fn validate(
        &self,
        r#type: &str,
        data: &serde_json::Value,
        meta: &serde_json::Value,
    ) -> Result<(), EventParserError> {
        let mut errors = Vec::new();

        if let Some(schemas) = self.types.get(r#type) {
            if let Some(validator) = &schemas.data {
                errors.extend(validator.validate(data));
            }
            if let Some(validator) = &schemas.meta {
                errors.extend(validator.validate(meta));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EventParserError { errors })
        }
    }
}
