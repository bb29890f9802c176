//! # Load Balancer Module
//!
//! Picks one upstream target per request.
//!
//! ## Algorithms
//!
//! 1. **Single target**: an upstream with exactly one usable node always answers that node.
//! 2. **Smooth weighted round-robin**: the nginx algorithm. Every pick adds each node's weight to
//!    its running score, returns the node with the highest score and subtracts the total weight
//!    from the winner. Over any `sum(weights)` consecutive picks starting from a fresh balancer each
//!    node is returned exactly `weight` times, and heavy nodes are interleaved with light ones
//!    instead of being returned in bursts.
//!
//! ## Rust Concepts Used
//!
//! - Targets are parsed into `url::Url` once when the balancer is built, so a request never parses
//!   an address
//! - `parking_lot::Mutex` serializes the score update, the only mutable state

use metrics::counter;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{Node, Upstream};

/// Selects the next upstream target
pub trait LoadBalancer: Send + Sync + fmt::Debug {
    /// Base URL (`scheme://host:port`) of the next target
    fn next(&self) -> &Url;

    /// Get the algorithm name for metrics and logging
    fn algorithm_name(&self) -> &'static str;

    /// Every target this balancer can return
    fn targets(&self) -> Vec<&Url>;
}

/// Always returns its one target
#[derive(Debug)]
pub struct SingleTarget {
    target: Url,
}

impl SingleTarget {
    pub fn new(target: Url) -> Self {
        Self { target }
    }
}

impl LoadBalancer for SingleTarget {
    fn next(&self) -> &Url {
        counter!("load_balancer_selections_total", "algorithm" => "single").increment(1);
        &self.target
    }

    fn algorithm_name(&self) -> &'static str {
        "single"
    }

    fn targets(&self) -> Vec<&Url> {
        vec![&self.target]
    }
}

/// A target and its weight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedTarget {
    pub url: Url,
    pub weight: u32,
}

/// Smooth weighted round-robin over two or more targets
pub struct SmoothWeightedRoundRobin {
    targets: Vec<WeightedTarget>,
    total_weight: i64,
    current: Mutex<Vec<i64>>,
}

impl fmt::Debug for SmoothWeightedRoundRobin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmoothWeightedRoundRobin")
            .field("targets", &self.targets)
            .field("total_weight", &self.total_weight)
            .finish()
    }
}

impl SmoothWeightedRoundRobin {
    /// Zero-weight targets are dropped; at least one positive weight is required
    pub fn new(targets: Vec<WeightedTarget>) -> GatewayResult<Self> {
        let targets: Vec<_> = targets.into_iter().filter(|t| t.weight > 0).collect();
        if targets.is_empty() {
            return Err(GatewayError::config(
                "weighted balancer needs at least one target with positive weight",
            ));
        }

        let total_weight = targets.iter().map(|t| i64::from(t.weight)).sum();
        let current = Mutex::new(vec![0; targets.len()]);
        Ok(Self {
            targets,
            total_weight,
            current,
        })
    }

    fn pick(&self) -> usize {
        let mut current = self.current.lock();

        let mut best = 0;
        for (index, target) in self.targets.iter().enumerate() {
            current[index] += i64::from(target.weight);
            if current[index] > current[best] {
                best = index;
            }
        }

        current[best] -= self.total_weight;
        best
    }
}

impl LoadBalancer for SmoothWeightedRoundRobin {
    fn next(&self) -> &Url {
        let index = self.pick();
        counter!("load_balancer_selections_total", "algorithm" => "roundrobin").increment(1);
        &self.targets[index].url
    }

    fn algorithm_name(&self) -> &'static str {
        "roundrobin"
    }

    fn targets(&self) -> Vec<&Url> {
        self.targets.iter().map(|t| &t.url).collect()
    }
}

/// Base URL of a node, bracketing IPv6 literals
pub fn node_url(scheme: &str, node: &Node) -> GatewayResult<Url> {
    let host = if node.host.contains(':') && !node.host.starts_with('[') {
        format!("[{}]", node.host)
    } else {
        node.host.clone()
    };

    Url::parse(&format!("{}://{}:{}", scheme, host, node.port)).map_err(|e| {
        GatewayError::config(format!(
            "invalid upstream node {}:{}: {}",
            node.host, node.port, e
        ))
    })
}

/// Build the balancer for an upstream
pub fn build_balancer(upstream: &Upstream) -> GatewayResult<Arc<dyn LoadBalancer>> {
    match upstream.lb_type.as_str() {
        "" | "roundrobin" => {}
        other => warn!(
            upstream_id = %upstream.id,
            lb_type = %other,
            "Unsupported balancer type, using roundrobin"
        ),
    }

    let scheme = upstream.scheme();
    let targets = upstream
        .nodes
        .iter()
        .filter(|node| node.weight > 0)
        .map(|node| {
            Ok(WeightedTarget {
                url: node_url(scheme, node)?,
                weight: node.weight,
            })
        })
        .collect::<GatewayResult<Vec<_>>>()?;

    debug!(
        upstream_id = %upstream.id,
        targets = targets.len(),
        "Building upstream balancer"
    );

    match targets.len() {
        0 => Err(GatewayError::config(format!(
            "upstream '{}' has no node with positive weight",
            upstream.id
        ))),
        1 => {
            let target = targets.into_iter().next().map(|t| t.url);
            let target = target.ok_or_else(|| GatewayError::internal("target vanished"))?;
            Ok(Arc::new(SingleTarget::new(target)))
        }
        _ => Ok(Arc::new(SmoothWeightedRoundRobin::new(targets)?)),
    }
}
