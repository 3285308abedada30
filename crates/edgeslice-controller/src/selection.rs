//! Candidate filtering and random node selection for slice reservations

use edgeslice_core::k8s_openapi::api::core::v1::ResourceRequirements;
use edgeslice_core::labels::{ACCESS_LABEL, ACCESS_PRIVATE, NONE, PRE_RESERVATION_LABEL, SLICE_LABEL};
use edgeslice_core::{Node, ParsedQuantity, Resource, ResourceTotals};
use rand::Rng;
use tracing::debug;

/// Per-node resource floor of a slice
#[derive(Debug, Clone, Default)]
pub struct Demand {
    pub limits: ResourceTotals,
    pub requests: ResourceTotals,
}

impl Demand {
    pub fn from_requirements(resources: &ResourceRequirements) -> edgeslice_core::Result<Self> {
        let limits = match &resources.limits {
            Some(list) => ResourceTotals::from_resource_list(list)?,
            None => ResourceTotals::new(),
        };
        let requests = match &resources.requests {
            Some(list) => ResourceTotals::from_resource_list(list)?,
            None => ResourceTotals::new(),
        };
        Ok(Self { limits, requests })
    }
}

/// Result of filtering a node
#[derive(Debug, Clone)]
pub struct FilterResult {
    /// Node name
    pub node_name: String,
    /// Whether the node passed the filter
    pub passed: bool,
    /// Reason for failure (if any)
    pub reason: Option<String>,
}

impl FilterResult {
    pub fn pass(node_name: String) -> Self {
        Self {
            node_name,
            passed: true,
            reason: None,
        }
    }

    pub fn fail(node_name: String, reason: String) -> Self {
        Self {
            node_name,
            passed: false,
            reason: Some(reason),
        }
    }
}

/// Predicate deciding whether a node may join a slice
pub trait CandidateFilter: Send + Sync {
    fn filter(&self, demand: &Demand, node: &Node) -> FilterResult;

    /// Name of the filter
    fn name(&self) -> &str;
}

/// Rejects nodes that are private or already held by a slice
pub struct UnclaimedNode;

impl CandidateFilter for UnclaimedNode {
    fn filter(&self, _demand: &Demand, node: &Node) -> FilterResult {
        let node_name = node.name().to_string();
        let labels = node.labels();

        if labels.get(ACCESS_LABEL).map(String::as_str) == Some(ACCESS_PRIVATE) {
            return FilterResult::fail(node_name, "Node is private".to_string());
        }
        // An absent label does not read as "none": only explicitly released nodes qualify
        for key in [SLICE_LABEL, PRE_RESERVATION_LABEL] {
            match labels.get(key).map(String::as_str) {
                Some(NONE) => {}
                Some(holder) => {
                    return FilterResult::fail(node_name, format!("Node is held: {}={}", key, holder))
                }
                None => return FilterResult::fail(node_name, format!("Node has no {} label", key)),
            }
        }

        FilterResult::pass(node_name)
    }

    fn name(&self) -> &str {
        "UnclaimedNode"
    }
}

/// Requires node capacity to cover every limit and every request
///
/// Limits and requests are both compared against raw capacity, with no
/// accounting for what is already running on the node.
pub struct NodeFitsResources;

impl NodeFitsResources {
    fn check(node: &Node, totals: &ResourceTotals, what: &str) -> Result<(), String> {
        let capacity = node.status.as_ref().and_then(|s| s.capacity.as_ref());
        for (key, wanted) in totals.iter() {
            let available = match capacity.and_then(|c| c.get(key)) {
                Some(q) => ParsedQuantity::from_quantity(q)
                    .map_err(|_| format!("Unparsable {} capacity '{}'", key, q.0))?,
                None => ParsedQuantity::ZERO,
            };
            if available < *wanted {
                return Err(format!(
                    "Insufficient {}: {} {}, capacity {}",
                    key, what, wanted, available
                ));
            }
        }
        Ok(())
    }
}

impl CandidateFilter for NodeFitsResources {
    fn filter(&self, demand: &Demand, node: &Node) -> FilterResult {
        let node_name = node.name().to_string();

        let fits = Self::check(node, &demand.limits, "limit")
            .and_then(|_| Self::check(node, &demand.requests, "request"));
        match fits {
            Ok(()) => FilterResult::pass(node_name),
            Err(reason) => FilterResult::fail(node_name, reason),
        }
    }

    fn name(&self) -> &str {
        "NodeFitsResources"
    }
}

/// Filters applied to every reservation
pub fn default_filters() -> Vec<Box<dyn CandidateFilter>> {
    vec![Box::new(UnclaimedNode), Box::new(NodeFitsResources)]
}

/// Names of the nodes passing every filter, in input order
pub fn eligible_nodes(filters: &[Box<dyn CandidateFilter>], demand: &Demand, nodes: &[Node]) -> Vec<String> {
    let mut eligible = Vec::new();
    'nodes: for node in nodes {
        for filter in filters {
            let result = filter.filter(demand, node);
            if !result.passed {
                debug!(
                    "Node {} failed filter {}: {}",
                    result.node_name,
                    filter.name(),
                    result.reason.as_deref().unwrap_or("unknown reason")
                );
                continue 'nodes;
            }
        }
        eligible.push(node.name().to_string());
    }
    eligible
}

/// Choose `count` distinct candidates uniformly at random. `None` when there
/// are fewer candidates than requested.
pub fn pick_nodes<R: Rng + ?Sized>(rng: &mut R, candidates: &[String], count: usize) -> Option<Vec<String>> {
    if count > candidates.len() {
        return None;
    }
    Some(
        rand::seq::index::sample(rng, candidates.len(), count)
            .into_iter()
            .map(|i| candidates[i].clone())
            .collect(),
    )
}
