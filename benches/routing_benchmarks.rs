//! # Routing Benchmarks
//!
//! Lookup cost of the routing table for exact, parameterised, prefix and missing paths.

use async_trait::async_trait;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

use api_dataplane::plugins::{GatewayRequest, Handler};
use api_dataplane::routing::{RouteRegistration, RoutingTable};

struct Noop;

#[async_trait]
impl Handler for Noop {
    async fn handle(&self, _req: &mut GatewayRequest) -> Response {
        StatusCode::NO_CONTENT.into_response()
    }
}

fn table_with_routes(count: usize) -> RoutingTable {
    let mut table = RoutingTable::new();
    let methods = vec!["GET".to_string()];
    for i in 0..count {
        let route_id = i.to_string();
        let registration = RouteRegistration {
            route_id: &route_id,
            methods: &methods,
            hosts: &[],
            priority: 0,
            handler: Arc::new(Noop),
        };
        table
            .insert(&format!("/api/service{}/items/:id", i), &registration)
            .unwrap();
        table
            .insert(&format!("/static/service{}/*", i), &registration)
            .unwrap();
        table
            .insert(&format!("/api/service{}/health", i), &registration)
            .unwrap();
    }
    table
}

fn benchmark_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("route_lookup");
    group.throughput(Throughput::Elements(1));

    for count in [10, 100, 1000] {
        let table = table_with_routes(count);
        let target = count / 2;
        let cases = [
            ("exact", format!("/api/service{}/health", target)),
            ("param", format!("/api/service{}/items/42", target)),
            ("prefix", format!("/static/service{}/css/site.css", target)),
            ("miss", "/nowhere/at/all".to_string()),
        ];

        for (name, path) in &cases {
            group.bench_with_input(BenchmarkId::new(*name, count), path, |b, path| {
                b.iter(|| black_box(table.lookup(&Method::GET, None, black_box(path)).is_some()));
            });
        }
    }

    group.finish();
}

criterion_group!(benches, benchmark_lookup);
criterion_main!(benches);
