//! Benchmarks for driver configuration rendering.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sds_controller::resource::config::{group_overrides, ConfigNode, ConfigSpec, ConfigVolume};
use sds_controller::Protocol;

fn spec(nodes: usize, volumes: usize) -> ConfigSpec {
    ConfigSpec {
        name: "bench".into(),
        port: 7100,
        protocol: Protocol::C,
        nodes: (0..nodes)
            .map(|i| ConfigNode {
                name: format!("node-{i}"),
                address: format!("10.0.1.{}", i + 1),
            })
            .collect(),
        volumes: (0..volumes)
            .map(|i| ConfigVolume {
                index: i as u32,
                minor: 100 + i as u32,
                device_path: format!("/dev/pool0/bench_data{i}"),
            })
            .collect(),
        overrides: group_overrides([
            ("net/max-buffers".to_string(), "8000".to_string()),
            ("net/sndbuf-size".to_string(), "512k".to_string()),
            ("al-extents".to_string(), "3389".to_string()),
            ("disk/c-max-rate".to_string(), "100M".to_string()),
        ]),
    }
}

fn bench_render(c: &mut Criterion) {
    let small = spec(2, 1);
    let large = spec(7, 16);

    c.bench_function("render_two_node_single_volume", |b| {
        b.iter(|| black_box(&small).render())
    });
    c.bench_function("render_seven_node_sixteen_volumes", |b| {
        b.iter(|| black_box(&large).render())
    });
}

criterion_group!(benches, bench_render);
criterion_main!(benches);
