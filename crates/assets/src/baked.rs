//! On-disk store of pre-baked artifacts, produced offline and consumed at
//! runtime as a fast path.
//!
//! Layout inside the store directory:
//! ```text
//! baked.meta.json       - store metadata and schema version
//! geometry/
//!   <hash>.cbor.zst     - converted geometry keyed by source path + variant
//! cells/
//!   m_<x>_<y>.cbor.zst  - merged meshes keyed by cell coordinate
//! impostors/
//!   p_<id>.cbor.zst     - impostor image + metadata keyed by prototype id
//! ```
//!
//! A missing artifact is an `Ok(None)`: the MID/FAR tiers silently skip
//! cells without baked content rather than generating it at runtime.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use farfield_common::{CellCoord, PrototypeId, SceneDescription, VariantId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::AssetError;

const BAKED_SCHEMA_VERSION: u32 = 1;

/// Metadata stored in baked.meta.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BakedMeta {
    schema_version: u32,
}

/// A pre-merged distant representation of one cell's static content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedMeshArtifact {
    pub cell: CellCoord,
    pub scene: SceneDescription,
    /// How many placements were merged in, for diagnostics.
    pub source_placements: u32,
}

/// A flat distant stand-in for one prototype: image plus placement metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpostorArtifact {
    pub prototype_id: PrototypeId,
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
    /// World-space height of the billboard.
    pub world_height: f32,
}

/// Directory-backed baked artifact store.
pub struct BakedStore {
    root: PathBuf,
}

impl BakedStore {
    /// Open or create a store at the given directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AssetError> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("geometry"))?;
        std::fs::create_dir_all(root.join("cells"))?;
        std::fs::create_dir_all(root.join("impostors"))?;

        let meta_path = root.join("baked.meta.json");
        if !meta_path.exists() {
            let meta = BakedMeta {
                schema_version: BAKED_SCHEMA_VERSION,
            };
            serde_json::to_writer_pretty(std::fs::File::create(&meta_path)?, &meta)?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write converted geometry for a source path + variant.
    pub fn bake_geometry(
        &self,
        source_path: &str,
        variant: VariantId,
        scene: &SceneDescription,
    ) -> Result<(), AssetError> {
        write_artifact(&self.geometry_path(source_path, variant), scene)
    }

    /// Read converted geometry, `None` if never baked.
    pub fn load_geometry(
        &self,
        source_path: &str,
        variant: VariantId,
    ) -> Result<Option<SceneDescription>, AssetError> {
        read_artifact(&self.geometry_path(source_path, variant))
    }

    pub fn bake_merged_mesh(&self, artifact: &MergedMeshArtifact) -> Result<(), AssetError> {
        write_artifact(&self.merged_path(artifact.cell), artifact)
    }

    pub fn load_merged_mesh(
        &self,
        cell: CellCoord,
    ) -> Result<Option<MergedMeshArtifact>, AssetError> {
        read_artifact(&self.merged_path(cell))
    }

    pub fn bake_impostor(&self, artifact: &ImpostorArtifact) -> Result<(), AssetError> {
        write_artifact(&self.impostor_path(artifact.prototype_id), artifact)
    }

    pub fn load_impostor(
        &self,
        prototype_id: PrototypeId,
    ) -> Result<Option<ImpostorArtifact>, AssetError> {
        read_artifact(&self.impostor_path(prototype_id))
    }

    fn geometry_path(&self, source_path: &str, variant: VariantId) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(source_path.as_bytes());
        hasher.update(variant.0.to_le_bytes());
        let digest = hasher.finalize();
        let mut short = String::with_capacity(32);
        for byte in &digest[..16] {
            short.push_str(&format!("{byte:02x}"));
        }
        self.root.join("geometry").join(format!("{short}.cbor.zst"))
    }

    fn merged_path(&self, cell: CellCoord) -> PathBuf {
        self.root
            .join("cells")
            .join(format!("m_{}_{}.cbor.zst", cell.x, cell.y))
    }

    fn impostor_path(&self, prototype_id: PrototypeId) -> PathBuf {
        self.root
            .join("impostors")
            .join(format!("p_{}.cbor.zst", prototype_id.0))
    }
}

fn write_artifact<T: Serialize>(path: &Path, value: &T) -> Result<(), AssetError> {
    let mut cbor = Vec::new();
    ciborium::into_writer(value, &mut cbor).map_err(|e| AssetError::CborEncode(e.to_string()))?;
    let mut encoder = zstd::Encoder::new(Vec::new(), 3)?;
    encoder.write_all(&cbor)?;
    let compressed = encoder.finish()?;
    std::fs::write(path, compressed)?;
    Ok(())
}

fn read_artifact<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, AssetError> {
    let compressed = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut decoder = zstd::Decoder::new(compressed.as_slice())?;
    let mut cbor = Vec::new();
    decoder.read_to_end(&mut cbor)?;
    let value =
        ciborium::from_reader(cbor.as_slice()).map_err(|e| AssetError::CborDecode(e.to_string()))?;
    Ok(Some(value))
}
