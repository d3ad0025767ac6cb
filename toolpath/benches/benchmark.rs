use std::f32::consts::{PI, TAU};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use common::config::{Axis, SliceConfig};
use toolpath::{
    mesh::Mesh,
    slicer::{intersect_plane_linear, partition, slice_shard, stepped_planes},
    Pos,
};

fn sphere(rings: usize) -> Mesh {
    let sectors = rings * 2;
    let point = |ring: usize, sector: usize| {
        let (theta, phi) = (ring as f32 / rings as f32 * PI, sector as f32 / sectors as f32 * TAU);
        Pos::new(theta.sin() * phi.cos(), theta.sin() * phi.sin(), theta.cos()) * 10.0
    };

    Mesh::from_triangles((0..rings).flat_map(|r| {
        (0..sectors).flat_map(move |s| {
            let (a, b) = (point(r, s), point(r, s + 1));
            let (c, d) = (point(r + 1, s), point(r + 1, s + 1));
            [[a, c, b], [b, c, d]]
        })
    }))
}

pub fn bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("Mesh Slicing");

    for rings in [32, 128, 256] {
        let mesh = sphere(rings);
        let (min, max) = mesh.bounds();
        let config = SliceConfig {
            step: 0.5,
            triangles_per_shard: 5_000,
            ..SliceConfig::default()
        };
        let planes = stepped_planes(min.z, max.z, &config);
        let shards = partition(&planes, mesh.triangle_count(), &config);

        group.bench_with_input(BenchmarkId::new("Linear", rings), &mesh, |b, mesh| {
            b.iter(|| {
                (planes.iter())
                    .map(|x| intersect_plane_linear(mesh, Axis::Z, x.z, config.epsilon).len())
                    .sum::<usize>()
            })
        });

        group.bench_with_input(BenchmarkId::new("Sharded", rings), &mesh, |b, mesh| {
            b.iter(|| {
                (shards.iter())
                    .map(|x| slice_shard(mesh, Axis::Z, x, config.epsilon).len())
                    .sum::<usize>()
            })
        });
    }
}

criterion_group!(benches, bench);
criterion_main!(benches);
