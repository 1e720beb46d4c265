use crate::reconcile::composite;
use crate::types::{Attribute, Composite, Value};
use std::collections::HashMap;
use tokio::time::Instant;

/// A value and when it was last written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamped {
    pub value: Value,
    pub at: Instant,
}

/// Desired and observed attribute values for one device
#[derive(Debug, Default)]
pub struct StateStore {
    desired: HashMap<Attribute, Stamped>,
    raw: HashMap<Attribute, Stamped>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn desired(&self, attribute: &str) -> Option<&Stamped> {
        self.desired.get(attribute)
    }

    pub fn raw(&self, attribute: &str) -> Option<&Stamped> {
        self.raw.get(attribute)
    }

    pub fn desired_value(&self, attribute: &str) -> Option<&Value> {
        self.desired.get(attribute).map(|s| &s.value)
    }

    pub fn raw_value(&self, attribute: &str) -> Option<&Value> {
        self.raw.get(attribute).map(|s| &s.value)
    }

    pub fn set_desired(&mut self, attribute: &str, value: Value, at: Instant) {
        self.desired.insert(attribute.to_string(), Stamped { value, at });
    }

    /// Record an observation, returning whether the value changed
    pub fn set_raw(&mut self, attribute: &str, value: Value, at: Instant) -> bool {
        let changed = self.raw_value(attribute) != Some(&value);
        self.raw.insert(attribute.to_string(), Stamped { value, at });
        changed
    }

    /// Whether the device currently reports the desired value
    pub fn is_converged(&self, attribute: &str) -> bool {
        match (self.desired_value(attribute), self.raw_value(attribute)) {
            (Some(d), Some(r)) => d == r,
            (None, _) => true,
            (Some(_), None) => false,
        }
    }

    pub fn composite(&self, attribute: &str) -> Option<Composite> {
        composite(self.desired_value(attribute), self.raw_value(attribute))
    }
}
