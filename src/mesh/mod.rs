//! Surface and structure meshes extracted from the octree

pub mod io;
pub mod marching;
pub mod tables;

pub use io::{save_mesh, save_structure};
pub use marching::octree_mesh;

use crate::core::types::{Affine3A, Result, Scale, Vec3};
use crate::image::Rgb;
use crate::map::data::{ColourData, FieldData, IdData};
use crate::map::Map;
use crate::octree::Octree;
use std::path::Path;

/// One surface triangle with optional per-vertex colour and a face
/// identifier (0 = none)
#[derive(Clone, Debug)]
pub struct Triangle {
    pub vertices: [Vec3; 3],
    pub colours: Option<[Rgb; 3]>,
    pub id: u16,
    /// Scale of the block data the face was extracted from
    pub scale: i8,
}

/// Meshes are face soups; vertex duplication is inherent to the per-block
/// extraction.
pub type TriangleMesh = Vec<Triangle>;

/// One quadrilateral face of the octree structure
#[derive(Clone, Debug)]
pub struct Quad {
    pub vertices: [Vec3; 4],
    pub scale: i8,
}

pub type QuadMesh = Vec<Quad>;

/// Mesh of the octant boxes, six quads per octant, in the octree frame in
/// voxel units transformed by `t_ov`. With `only_leaves` interior nodes are
/// skipped.
pub fn octree_structure_mesh<F: FieldData, C: ColourData, I: IdData>(
    octree: &Octree<F, C, I>,
    t_ov: Affine3A,
    only_leaves: bool,
) -> QuadMesh {
    // Vertex indices into the corner array for each of the six box faces
    const FACES: [[usize; 4]; 6] = [
        [0, 2, 3, 1],
        [1, 3, 7, 5],
        [5, 7, 6, 4],
        [0, 4, 6, 2],
        [0, 1, 5, 4],
        [2, 6, 7, 3],
    ];

    let mut mesh = QuadMesh::new();
    for id in octree.iter_octants() {
        if only_leaves && !octree.octant_is_leaf(id) {
            continue;
        }
        let coord = octree.octant_coord(id);
        let size = octree.octant_size(id);
        let scale = match id.as_block() {
            Some(b) => octree.block(b).current_scale() as i8,
            // Nodes have no meaningful scale, pick one that renders grey
            None => 7,
        };

        let mut corners = [Vec3::ZERO; 8];
        for (k, corner) in corners.iter_mut().enumerate() {
            let offset = Vec3::new(
                (k & 1) as f32,
                ((k >> 1) & 1) as f32,
                ((k >> 2) & 1) as f32,
            );
            *corner = t_ov.transform_point3(coord.as_vec3() + size as f32 * offset);
        }
        for face in &FACES {
            mesh.push(Quad {
                vertices: [
                    corners[face[0]],
                    corners[face[1]],
                    corners[face[2]],
                    corners[face[3]],
                ],
                scale,
            });
        }
    }
    mesh
}

impl<F: FieldData, C: ColourData, I: IdData> Map<F, C, I> {
    /// Surface mesh in the octree frame in voxel units, transformed by
    /// `t_ov`. Only block data at `min_desired_scale` or coarser is used.
    pub fn mesh(&self, t_ov: Affine3A, min_desired_scale: Scale) -> TriangleMesh {
        octree_mesh(self.octree(), t_ov, min_desired_scale)
    }

    /// Surface mesh in world coordinates in metres
    pub fn mesh_world(&self, min_desired_scale: Scale) -> TriangleMesh {
        let t_wv = Affine3A::from_translation(self.origin())
            * Affine3A::from_scale(Vec3::splat(self.res()));
        self.mesh(t_wv, min_desired_scale)
    }

    /// Octree structure mesh, six quads per (leaf) octant
    pub fn structure(&self, t_ov: Affine3A, only_leaves: bool) -> QuadMesh {
        octree_structure_mesh(self.octree(), t_ov, only_leaves)
    }

    /// Extract the surface mesh and save it, the format picked from the
    /// file extension (.ply, .obj or .vtk)
    pub fn save_mesh<P: AsRef<Path>>(
        &self,
        path: P,
        t_ov: Affine3A,
        min_desired_scale: Scale,
    ) -> Result<()> {
        save_mesh(&self.mesh(t_ov, min_desired_scale), path)
    }

    /// Extract the structure mesh and save it
    pub fn save_structure<P: AsRef<Path>>(
        &self,
        path: P,
        t_ov: Affine3A,
        only_leaves: bool,
    ) -> Result<()> {
        save_structure(&self.structure(t_ov, only_leaves), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::data::OccupancyField;

    #[test]
    fn test_structure_mesh_counts() {
        let mut octree: Octree<OccupancyField> = Octree::new(16, 8).unwrap();
        let root = octree.root();
        octree.allocate_child(root, 0);
        octree.allocate_child(root, 5);

        // Two block leaves, six quads each
        let leaves = octree_structure_mesh(&octree, Affine3A::IDENTITY, true);
        assert_eq!(leaves.len(), 12);
        // Including the root node: one more octant
        let all = octree_structure_mesh(&octree, Affine3A::IDENTITY, false);
        assert_eq!(all.len(), 18);
    }

    #[test]
    fn test_structure_mesh_transform() {
        let mut octree: Octree<OccupancyField> = Octree::new(16, 8).unwrap();
        let root = octree.root();
        octree.allocate_child(root, 0);
        let t = Affine3A::from_scale(Vec3::splat(0.5));
        let mesh = octree_structure_mesh(&octree, t, true);
        for quad in &mesh {
            for v in &quad.vertices {
                assert!(v.max_element() <= 4.0);
            }
        }
    }
}
