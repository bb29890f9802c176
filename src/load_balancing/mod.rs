pub mod balancer;

pub use balancer::{
    build_balancer, node_url, LoadBalancer, SingleTarget, SmoothWeightedRoundRobin, WeightedTarget,
};
