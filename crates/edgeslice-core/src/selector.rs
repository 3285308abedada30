//! Label and field selectors in Kubernetes query syntax.

use k8s_openapi::api::core::v1::{NodeSelectorRequirement, NodeSelectorTerm};
use std::collections::BTreeMap;
use std::fmt;

/// Selector operators understood by node selection. `Gt` and `Lt` are
/// accepted by the schema but have no counterpart here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl SelectorOperator {
    /// Map a NodeSelectorRequirement operator, `None` if unsupported
    pub fn from_node_operator(op: &str) -> Option<Self> {
        match op {
            "In" => Some(Self::In),
            "NotIn" => Some(Self::NotIn),
            "Exists" => Some(Self::Exists),
            "DoesNotExist" => Some(Self::DoesNotExist),
            _ => None,
        }
    }
}

/// A single `key operator values` clause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub operator: SelectorOperator,
    pub values: Vec<String>,
}

impl Requirement {
    pub fn new(key: impl Into<String>, operator: SelectorOperator, values: Vec<String>) -> Self {
        Self {
            key: key.into(),
            operator,
            values,
        }
    }

    /// `key=value`
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(key, SelectorOperator::In, vec![value.into()])
    }

    pub fn matches(&self, set: &BTreeMap<String, String>) -> bool {
        let value = set.get(&self.key);
        match self.operator {
            SelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            SelectorOperator::NotIn => value.is_none_or(|v| !self.values.contains(v)),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            SelectorOperator::In if self.values.len() == 1 => {
                write!(f, "{}={}", self.key, self.values[0])
            }
            SelectorOperator::In => write!(f, "{} in ({})", self.key, self.values.join(",")),
            SelectorOperator::NotIn => {
                write!(f, "{} notin ({})", self.key, self.values.join(","))
            }
            SelectorOperator::Exists => write!(f, "{}", self.key),
            SelectorOperator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// A conjunction of requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    pub fn push(&mut self, requirement: Requirement) {
        self.requirements.push(requirement);
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, set: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(set))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        f.write_str(&rendered.join(","))
    }
}

/// Label and field selectors derived from one NodeSelectorTerm
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TermSelectors {
    /// From `matchExpressions`
    pub labels: Selector,
    /// From `matchFields`
    pub fields: Selector,
    /// Requirements whose operator has no translation (`Gt`, `Lt`, ...)
    pub skipped: Vec<String>,
}

impl TermSelectors {
    pub fn from_term(term: &NodeSelectorTerm) -> Self {
        let mut out = Self::default();
        for requirement in term.match_expressions.iter().flatten() {
            match translate(requirement) {
                Some(r) => out.labels.push(r),
                None => out.skipped.push(describe(requirement)),
            }
        }
        for requirement in term.match_fields.iter().flatten() {
            match translate(requirement) {
                Some(r) => out.fields.push(r),
                None => out.skipped.push(describe(requirement)),
            }
        }
        out
    }
}

fn translate(requirement: &NodeSelectorRequirement) -> Option<Requirement> {
    let operator = SelectorOperator::from_node_operator(&requirement.operator)?;
    let values = match operator {
        SelectorOperator::In | SelectorOperator::NotIn => {
            requirement.values.clone().unwrap_or_default()
        }
        SelectorOperator::Exists | SelectorOperator::DoesNotExist => Vec::new(),
    };
    Some(Requirement::new(requirement.key.clone(), operator, values))
}

fn describe(requirement: &NodeSelectorRequirement) -> String {
    format!(
        "{} {} ({})",
        requirement.key,
        requirement.operator,
        requirement.values.clone().unwrap_or_default().join(",")
    )
}
