use criterion::{black_box, criterion_group, criterion_main, Criterion};

use glam::{Affine3A, Vec3};
use voxfuse::image::Image;
use voxfuse::integrator::{integrate, Measurements};
use voxfuse::map::data::{OccupancyConfig, OccupancyField};
use voxfuse::map::{Map, MapConfig};
use voxfuse::sensor::{PinholeCamera, PinholeCameraConfig};

fn test_camera() -> PinholeCamera {
    PinholeCamera::new(PinholeCameraConfig {
        width: 160,
        height: 120,
        fx: 120.0,
        fy: 120.0,
        cx: 79.5,
        cy: 59.5,
        near_plane: 0.1,
        far_plane: 10.0,
        pixel_voxel_ratio_per_scale: vec![1.5, 3.0, 6.0],
    })
    .unwrap()
}

fn wall_depth(camera_width: u32, camera_height: u32) -> Image<f32> {
    // Slanted wall so the carver sees depth gradients
    let mut depth = Image::new(camera_width, camera_height, 0.0f32);
    for y in 0..camera_height {
        for x in 0..camera_width {
            *depth.get_mut(x, y) = 2.0 + 0.005 * x as f32;
        }
    }
    depth
}

fn bench_integrate_frame(c: &mut Criterion) {
    let camera = test_camera();
    let depth = wall_depth(160, 120);
    let sigma = Image::new(160, 120, 0.02f32);

    c.bench_function("integrate_wall_frame", |b| {
        b.iter(|| {
            let mut map: Map<OccupancyField> = Map::new(
                MapConfig {
                    dim: Vec3::splat(6.4),
                    res: 0.05,
                    origin: Some(Vec3::new(-3.2, -3.2, 0.0)),
                    block_size: 8,
                },
                OccupancyConfig::default(),
            )
            .unwrap();
            let measurements = Measurements {
                depth: black_box(&depth),
                depth_sigma: &sigma,
                t_ws: Affine3A::IDENTITY,
                colour: None,
                id: None,
            };
            integrate(&mut map, &camera, &measurements, 1, None).unwrap();
            map
        });
    });
}

fn bench_mesh_extraction(c: &mut Criterion) {
    let camera = test_camera();
    let depth = wall_depth(160, 120);
    let sigma = Image::new(160, 120, 0.02f32);
    let mut map: Map<OccupancyField> = Map::new(
        MapConfig {
            dim: Vec3::splat(6.4),
            res: 0.05,
            origin: Some(Vec3::new(-3.2, -3.2, 0.0)),
            block_size: 8,
        },
        OccupancyConfig::default(),
    )
    .unwrap();
    let measurements = Measurements {
        depth: &depth,
        depth_sigma: &sigma,
        t_ws: Affine3A::IDENTITY,
        colour: None,
        id: None,
    };
    integrate(&mut map, &camera, &measurements, 1, None).unwrap();

    c.bench_function("mesh_wall_map", |b| {
        b.iter(|| map.mesh(black_box(Affine3A::IDENTITY), 0));
    });
}

criterion_group!(benches, bench_integrate_frame, bench_mesh_extraction);
criterion_main!(benches);
