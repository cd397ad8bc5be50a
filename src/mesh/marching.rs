//! Per-block marching cubes
//!
//! Each block is contoured at its current integration scale (or coarser if
//! requested). Cell corners on block seams are sampled through the visitor,
//! so neighbouring blocks contribute their data at whatever scale they hold
//! it.

use crate::core::types::{Affine3A, Scale, Vec3, SCALE_UNINIT};
use crate::image::Rgb;
use crate::map::data::{ColourData, FieldData, IdData, Voxel};
use crate::math::encode_morton_3d;
use crate::mesh::tables::{CORNER_OFFSETS, EDGE_CONNECTIONS, EDGE_TABLE, TRI_TABLE};
use crate::mesh::{Triangle, TriangleMesh};
use crate::octree::pool::BlockId;
use crate::octree::{visitor, Octree};
use glam::IVec3;
use rayon::prelude::*;

/// Extract the surface mesh of the whole octree. Faces are in the octree
/// frame in voxel units, transformed by `t_ov`.
pub fn octree_mesh<F: FieldData, C: ColourData, I: IdData>(
    octree: &Octree<F, C, I>,
    t_ov: Affine3A,
    min_desired_scale: Scale,
) -> TriangleMesh {
    let mut blocks: Vec<BlockId> = octree.iter_blocks().collect();
    // Morton order keeps the face order independent of the traversal
    blocks.sort_by_key(|b| {
        let c = octree.block(*b).coord;
        encode_morton_3d(c.x as u32, c.y as u32, c.z as u32)
    });

    let meshes: Vec<TriangleMesh> = blocks
        .par_iter()
        .map(|b| mesh_block(octree, *b, t_ov, min_desired_scale))
        .collect();

    let mut mesh = TriangleMesh::with_capacity(meshes.iter().map(|m| m.len()).sum());
    for m in meshes {
        mesh.extend(m);
    }
    log::debug!("Extracted {} triangles from {} blocks", mesh.len(), blocks.len());
    mesh
}

/// Sample a cell corner: inside the block directly, across the seam through
/// the visitor. Returns `None` for unobserved corners.
fn corner_data<F: FieldData, C: ColourData, I: IdData>(
    octree: &Octree<F, C, I>,
    block: &crate::octree::Block<F, C, I>,
    coord: IVec3,
    scale: Scale,
) -> Option<Voxel<F, C, I>> {
    let in_block = coord.cmpge(block.coord).all()
        && coord.cmplt(block.coord + IVec3::splat(block.size)).all();
    let data = if in_block {
        *block.data_at(coord, scale)
    } else {
        visitor::get_data_at(octree, coord, scale).0
    };
    if data.field.valid() {
        Some(data)
    } else {
        None
    }
}

fn mesh_block<F: FieldData, C: ColourData, I: IdData>(
    octree: &Octree<F, C, I>,
    block_id: BlockId,
    t_ov: Affine3A,
    min_desired_scale: Scale,
) -> TriangleMesh {
    let block = octree.block(block_id);
    if block.min_scale() == SCALE_UNINIT {
        return TriangleMesh::new();
    }
    let scale = block.current_scale().max(min_desired_scale).min(block.max_scale());
    let stride = 1 << scale;
    let size_at_scale = block.size_at_scale(scale);

    let mut mesh = TriangleMesh::new();
    let mut corner_voxels: [Option<Voxel<F, C, I>>; 8] = [None; 8];
    let mut values = [0.0f32; 8];
    let mut positions = [Vec3::ZERO; 8];

    for cz in 0..size_at_scale {
        for cy in 0..size_at_scale {
            for cx in 0..size_at_scale {
                let mut all_observed = true;
                for k in 0..8 {
                    let offset = IVec3::new(
                        CORNER_OFFSETS[k][0],
                        CORNER_OFFSETS[k][1],
                        CORNER_OFFSETS[k][2],
                    );
                    let coord = block.coord + stride * (IVec3::new(cx, cy, cz) + offset);
                    match corner_data(octree, block, coord, scale) {
                        Some(data) => {
                            values[k] = data.field.surface_value();
                            // Sample point of the voxel holding this corner
                            positions[k] =
                                coord.as_vec3() + Vec3::splat(0.5 * stride as f32);
                            corner_voxels[k] = Some(data);
                        }
                        None => {
                            all_observed = false;
                            break;
                        }
                    }
                }
                if !all_observed {
                    continue;
                }

                let mut cube_index = 0usize;
                for (k, value) in values.iter().enumerate() {
                    if *value < 0.0 {
                        cube_index |= 1 << k;
                    }
                }
                if EDGE_TABLE[cube_index] == 0 {
                    continue;
                }

                // Vertex on each intersected edge, with interpolated colour
                let mut edge_vertices = [Vec3::ZERO; 12];
                let mut edge_colours = [Rgb::default(); 12];
                for e in 0..12 {
                    if EDGE_TABLE[cube_index] & (1 << e) == 0 {
                        continue;
                    }
                    let [a, b] = EDGE_CONNECTIONS[e];
                    let va = values[a];
                    let vb = values[b];
                    let t = if (va - vb).abs() < 1e-12 {
                        0.5
                    } else {
                        (va / (va - vb)).clamp(0.0, 1.0)
                    };
                    edge_vertices[e] = positions[a] + t * (positions[b] - positions[a]);
                    if C::ENABLED {
                        let ca = corner_voxels[a]
                            .as_ref()
                            .and_then(|v| v.colour.rgb())
                            .unwrap_or_default();
                        let cb = corner_voxels[b]
                            .as_ref()
                            .and_then(|v| v.colour.rgb())
                            .unwrap_or_default();
                        let mix = |x: u8, y: u8| {
                            (x as f32 + t * (y as f32 - x as f32)).round() as u8
                        };
                        edge_colours[e] =
                            Rgb::new(mix(ca.r, cb.r), mix(ca.g, cb.g), mix(ca.b, cb.b));
                    }
                }

                let face_id = if I::ENABLED {
                    corner_voxels
                        .iter()
                        .flatten()
                        .find_map(|v| v.id.id())
                        .unwrap_or(0)
                } else {
                    0
                };

                let tri_edges = &TRI_TABLE[cube_index];
                let mut i = 0;
                while tri_edges[i] != -1 {
                    let e0 = tri_edges[i] as usize;
                    let e1 = tri_edges[i + 1] as usize;
                    let e2 = tri_edges[i + 2] as usize;
                    mesh.push(Triangle {
                        vertices: [
                            t_ov.transform_point3(edge_vertices[e0]),
                            t_ov.transform_point3(edge_vertices[e1]),
                            t_ov.transform_point3(edge_vertices[e2]),
                        ],
                        colours: if C::ENABLED {
                            Some([edge_colours[e0], edge_colours[e1], edge_colours[e2]])
                        } else {
                            None
                        },
                        id: face_id,
                        scale: scale as i8,
                    });
                    i += 3;
                }
            }
        }
    }
    mesh
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::data::{TsdfField, TSDF_SCALE};

    type TsdfOctree = Octree<TsdfField>;

    fn block_with_plane(octree: &mut TsdfOctree, scale: Scale) -> BlockId {
        let root = octree.root();
        let (child, _) = octree.allocate_child(root, 0);
        let block_id = child.as_block().unwrap();
        let block = octree.block_mut(block_id);
        block.allocate_down_to(scale);
        let size_at_scale = block.size_at_scale(scale);
        let coord = block.coord;
        let stride = 1 << scale;
        for z in 0..size_at_scale {
            for y in 0..size_at_scale {
                for x in 0..size_at_scale {
                    let v = coord + stride * IVec3::new(x, y, z);
                    let idx = block.voxel_idx(v, scale);
                    // Signed distance to the x = 4 plane, sampled at voxel
                    // centres
                    let sample_x = v.x as f32 + 0.5 * stride as f32;
                    let tsdf = ((sample_x - 4.0) / 8.0).clamp(-1.0, 1.0);
                    block.data_slice_at_scale_mut(scale)[idx].field = TsdfField {
                        tsdf: (tsdf * TSDF_SCALE) as i16,
                        weight: 5,
                    };
                }
            }
        }
        block_id
    }

    #[test]
    fn test_uniform_outside_block_produces_no_triangles() {
        let mut octree = TsdfOctree::new(16, 8).unwrap();
        let root = octree.root();
        let (child, _) = octree.allocate_child(root, 0);
        let block_id = child.as_block().unwrap();
        let block = octree.block_mut(block_id);
        block.allocate_down_to(0);
        for v in block.data_slice_at_scale_mut(0) {
            v.field = TsdfField {
                tsdf: TSDF_SCALE as i16,
                weight: 5,
            };
        }
        let mesh = octree_mesh(&octree, Affine3A::IDENTITY, 0);
        assert!(mesh.is_empty());
    }

    #[test]
    fn test_planar_surface_triangles() {
        let mut octree = TsdfOctree::new(16, 8).unwrap();
        block_with_plane(&mut octree, 0);
        let mesh = octree_mesh(&octree, Affine3A::IDENTITY, 0);

        // One crossing cell per interior row, two triangles per cell
        assert_eq!(mesh.len(), 2 * 7 * 7);
        for tri in &mesh {
            for v in &tri.vertices {
                assert!(
                    (v.x - 4.0).abs() < 1e-3,
                    "vertex off the x = 4 plane: {:?}",
                    v
                );
            }
            assert_eq!(tri.scale, 0);
        }
    }

    #[test]
    fn test_planar_surface_at_coarser_scale() {
        let mut octree = TsdfOctree::new(16, 8).unwrap();
        block_with_plane(&mut octree, 1);
        let mesh = octree_mesh(&octree, Affine3A::IDENTITY, 0);
        assert!(!mesh.is_empty());
        for tri in &mesh {
            for v in &tri.vertices {
                assert!((v.x - 4.0).abs() < 1e-3);
            }
            assert_eq!(tri.scale, 1);
        }
    }

    #[test]
    fn test_unintegrated_block_is_skipped() {
        let mut octree = TsdfOctree::new(16, 8).unwrap();
        let root = octree.root();
        octree.allocate_child(root, 0);
        let mesh = octree_mesh(&octree, Affine3A::IDENTITY, 0);
        assert!(mesh.is_empty());
    }

    #[test]
    fn test_mesh_uses_init_default() {
        // Default TSDF data is invalid, so an allocated but never written
        // voxel must not contribute geometry even next to valid data
        let mut octree = TsdfOctree::new(16, 8).unwrap();
        let root = octree.root();
        let (child, _) = octree.allocate_child(root, 0);
        let block_id = child.as_block().unwrap();
        let block = octree.block_mut(block_id);
        block.allocate_down_to(0);
        let idx = block.voxel_idx(IVec3::new(3, 3, 3), 0);
        block.data_slice_at_scale_mut(0)[idx].field = TsdfField {
            tsdf: -(TSDF_SCALE as i16) / 2,
            weight: 5,
        };
        let mesh = octree_mesh(&octree, Affine3A::IDENTITY, 0);
        assert!(mesh.is_empty());
    }
}
