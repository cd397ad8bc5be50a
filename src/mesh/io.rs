//! Mesh file writers
//!
//! PLY (binary little-endian), OBJ and legacy VTK, picked by file
//! extension. Files are written to a temporary sibling and renamed into
//! place, so an aborted write never clobbers an existing mesh.

use crate::core::error::Error;
use crate::core::types::{Result, Vec3};
use crate::image::Rgb;
use crate::mesh::{QuadMesh, TriangleMesh};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Face soup shared by all writers
struct SoupMesh {
    vertices: Vec<Vec3>,
    colours: Option<Vec<Rgb>>,
    face_size: usize,
}

impl SoupMesh {
    fn from_triangles(mesh: &TriangleMesh) -> Self {
        let has_colour = mesh.iter().any(|t| t.colours.is_some());
        let mut vertices = Vec::with_capacity(mesh.len() * 3);
        let mut colours = has_colour.then(|| Vec::with_capacity(mesh.len() * 3));
        for tri in mesh {
            vertices.extend_from_slice(&tri.vertices);
            if let Some(colours) = colours.as_mut() {
                let c = tri.colours.unwrap_or([Rgb::new(255, 255, 255); 3]);
                colours.extend_from_slice(&c);
            }
        }
        Self {
            vertices,
            colours,
            face_size: 3,
        }
    }

    fn from_quads(mesh: &QuadMesh) -> Self {
        let mut vertices = Vec::with_capacity(mesh.len() * 4);
        for quad in mesh {
            vertices.extend_from_slice(&quad.vertices);
        }
        Self {
            vertices,
            colours: None,
            face_size: 4,
        }
    }

    fn face_count(&self) -> usize {
        self.vertices.len() / self.face_size
    }
}

/// Save a surface mesh, format picked from the extension
pub fn save_mesh<P: AsRef<Path>>(mesh: &TriangleMesh, path: P) -> Result<()> {
    save_soup(&SoupMesh::from_triangles(mesh), path.as_ref())
}

/// Save a structure mesh, format picked from the extension
pub fn save_structure<P: AsRef<Path>>(mesh: &QuadMesh, path: P) -> Result<()> {
    save_soup(&SoupMesh::from_quads(mesh), path.as_ref())
}

fn save_soup(mesh: &SoupMesh, path: &Path) -> Result<()> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let tmp_path = path.with_extension(format!("{}.tmp", ext));
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        match ext.as_str() {
            "ply" => write_ply(mesh, &mut writer)?,
            "obj" => write_obj(mesh, &mut writer)?,
            "vtk" => write_vtk(mesh, &mut writer)?,
            _ => {
                return Err(Error::Config(format!(
                    "unsupported mesh extension '{}', expected ply, obj or vtk",
                    ext
                )))
            }
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp_path, path)?;
    log::info!(
        "Saved {} faces to {}",
        mesh.face_count(),
        path.display()
    );
    Ok(())
}

fn write_ply<W: Write>(mesh: &SoupMesh, w: &mut W) -> Result<()> {
    writeln!(w, "ply")?;
    writeln!(w, "format binary_little_endian 1.0")?;
    writeln!(w, "element vertex {}", mesh.vertices.len())?;
    writeln!(w, "property float x")?;
    writeln!(w, "property float y")?;
    writeln!(w, "property float z")?;
    if mesh.colours.is_some() {
        writeln!(w, "property uchar red")?;
        writeln!(w, "property uchar green")?;
        writeln!(w, "property uchar blue")?;
    }
    writeln!(w, "element face {}", mesh.face_count())?;
    writeln!(w, "property list uchar int vertex_indices")?;
    writeln!(w, "end_header")?;

    match &mesh.colours {
        None => {
            // Positions only: one flat little-endian float array
            let floats: Vec<f32> = mesh
                .vertices
                .iter()
                .flat_map(|v| [v.x, v.y, v.z])
                .collect();
            w.write_all(bytemuck::cast_slice(&floats))?;
        }
        Some(colours) => {
            for (v, c) in mesh.vertices.iter().zip(colours) {
                w.write_all(&v.x.to_le_bytes())?;
                w.write_all(&v.y.to_le_bytes())?;
                w.write_all(&v.z.to_le_bytes())?;
                w.write_all(&[c.r, c.g, c.b])?;
            }
        }
    }
    for face in 0..mesh.face_count() {
        w.write_all(&[mesh.face_size as u8])?;
        for k in 0..mesh.face_size {
            w.write_all(&((face * mesh.face_size + k) as i32).to_le_bytes())?;
        }
    }
    Ok(())
}

fn write_obj<W: Write>(mesh: &SoupMesh, w: &mut W) -> Result<()> {
    for v in &mesh.vertices {
        writeln!(w, "v {} {} {}", v.x, v.y, v.z)?;
    }
    for face in 0..mesh.face_count() {
        write!(w, "f")?;
        // OBJ indices are 1-based
        for k in 0..mesh.face_size {
            write!(w, " {}", face * mesh.face_size + k + 1)?;
        }
        writeln!(w)?;
    }
    Ok(())
}

fn write_vtk<W: Write>(mesh: &SoupMesh, w: &mut W) -> Result<()> {
    writeln!(w, "# vtk DataFile Version 1.0")?;
    writeln!(w, "Mesh")?;
    writeln!(w, "ASCII")?;
    writeln!(w)?;
    writeln!(w, "DATASET POLYDATA")?;
    writeln!(w, "POINTS {} FLOAT", mesh.vertices.len())?;
    for v in &mesh.vertices {
        writeln!(w, "{} {} {}", v.x, v.y, v.z)?;
    }
    writeln!(w)?;
    writeln!(
        w,
        "POLYGONS {} {}",
        mesh.face_count(),
        mesh.face_count() * (mesh.face_size + 1)
    )?;
    for face in 0..mesh.face_count() {
        write!(w, "{}", mesh.face_size)?;
        for k in 0..mesh.face_size {
            write!(w, " {}", face * mesh.face_size + k)?;
        }
        writeln!(w)?;
    }
    Ok(())
}
