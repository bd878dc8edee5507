//! Converted-asset handling: the in-process asset cache, the reusable
//! instance pool, and the on-disk store of pre-baked artifacts.
//!
//! The decoders that turn archive bytes into [`SceneDescription`]s live
//! outside this engine; they are consumed through the [`AssetDecoder`]
//! trait, which must be callable from worker threads.

mod baked;
mod cache;
mod pool;

pub use baked::{BakedStore, ImpostorArtifact, MergedMeshArtifact};
pub use cache::{AssetCache, AssetKey, CacheStats};
pub use pool::{InstanceHandle, ObjectPool, PoolConfig, PooledInstance};

use farfield_common::{NodeKind, SceneDescription, VariantId};

/// Errors from asset operations.
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR encode error: {0}")]
    CborEncode(String),
    #[error("CBOR decode error: {0}")]
    CborDecode(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// Errors from an asset decoder.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed asset bytes: {0}")]
    Malformed(String),
    #[error("unsupported variant: {0:?}")]
    UnsupportedVariant(VariantId),
}

/// Converts raw archive bytes into a scene-graph-ready description.
///
/// Implementations are pure and must be safe to call from worker threads.
pub trait AssetDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8], variant: VariantId) -> Result<SceneDescription, DecodeError>;
}

/// Deterministic decoder used by tests and the headless driver.
///
/// Treats the payload as a tiny text format: `kind:vertex_count:index_count`.
/// Any payload beginning with `!` decodes as malformed, which gives tests a
/// known-corrupt input.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyntheticDecoder;

impl AssetDecoder for SyntheticDecoder {
    fn decode(&self, bytes: &[u8], variant: VariantId) -> Result<SceneDescription, DecodeError> {
        if bytes.first() == Some(&b'!') {
            return Err(DecodeError::Malformed("corrupt payload marker".into()));
        }
        let text = std::str::from_utf8(bytes)
            .map_err(|_| DecodeError::Malformed("non-utf8 payload".into()))?;
        let mut parts = text.trim().split(':');
        let kind = match parts.next() {
            Some("object") => NodeKind::Object,
            Some("light") => NodeKind::Light,
            Some("actor") => NodeKind::Actor,
            other => {
                return Err(DecodeError::Malformed(format!(
                    "unknown node kind {other:?}"
                )));
            }
        };
        let vertex_count: u32 = parts
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| DecodeError::Malformed("missing vertex count".into()))?;
        let index_count: u32 = parts
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| DecodeError::Malformed("missing index count".into()))?;

        Ok(SceneDescription {
            name: format!("synthetic/{}/{}", variant.0, vertex_count),
            kind,
            vertex_count,
            index_count,
            // 32 bytes per vertex, 4 per index: a plausible interleaved layout.
            approx_bytes: vertex_count as usize * 32 + index_count as usize * 4,
        })
    }
}

pub fn crate_info() -> &'static str {
    "farfield-assets v0.1.0"
}
