//! Request routing: the immutable routing table and the builder producing it from the store.

pub mod builder;
pub mod router;

pub use builder::RouteBuilder;
pub use router::{convert_uri, PathPattern, RouteMatch, RouteRegistration, RoutingTable};
