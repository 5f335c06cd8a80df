use foundation::TileCoord;

use crate::feature::AssembledLayers;
use crate::topology::encode_topology;
use crate::vector_tile::{VectorTileError, VectorTileOptions, encode_vector_tile};

/// Output format chosen by the request's file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileEncoding {
    TopoJson,
    Mvt,
}

impl TileEncoding {
    /// `topojson`, `mvt` or its `pbf` alias; anything else is unsupported.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "topojson" => Some(Self::TopoJson),
            "mvt" | "pbf" => Some(Self::Mvt),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::TopoJson => "application/json",
            Self::Mvt => "application/vnd.mapbox-vector-tile",
        }
    }
}

/// Response body plus the content type to send it with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileBody {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

impl TileBody {
    pub fn new(bytes: Vec<u8>, content_type: &'static str) -> Self {
        Self {
            bytes,
            content_type,
        }
    }

    /// Raw emissions are passed through untouched and typed as opaque bytes.
    pub fn raw(bytes: Vec<u8>) -> Self {
        Self::new(bytes, "application/octet-stream")
    }
}

#[derive(Debug)]
pub enum EncodeError {
    Json(serde_json::Error),
    VectorTile(VectorTileError),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::Json(e) => write!(f, "topology serialization failed: {e}"),
            EncodeError::VectorTile(e) => write!(f, "vector tile encoding failed: {e}"),
        }
    }
}

impl std::error::Error for EncodeError {}

impl From<serde_json::Error> for EncodeError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<VectorTileError> for EncodeError {
    fn from(value: VectorTileError) -> Self {
        Self::VectorTile(value)
    }
}

/// Encodes a complete set of layers in `encoding`.
pub fn encode(
    layers: &AssembledLayers,
    coord: TileCoord,
    encoding: TileEncoding,
    options: &VectorTileOptions,
) -> Result<TileBody, EncodeError> {
    let bytes = match encoding {
        TileEncoding::TopoJson => serde_json::to_vec(&encode_topology(layers))?,
        TileEncoding::Mvt => encode_vector_tile(layers, coord, options)?,
    };
    Ok(TileBody::new(bytes, encoding.content_type()))
}

#[cfg(test)]
mod tests {
    use foundation::TileCoord;
    use serde_json::Value;

    use super::{TileEncoding, encode};
    use crate::feature::AssembledLayers;
    use crate::vector_tile::VectorTileOptions;

    #[test]
    fn extension_lookup() {
        assert_eq!(TileEncoding::from_extension("topojson"), Some(TileEncoding::TopoJson));
        assert_eq!(TileEncoding::from_extension("mvt"), Some(TileEncoding::Mvt));
        assert_eq!(TileEncoding::from_extension("pbf"), Some(TileEncoding::Mvt));
        assert_eq!(TileEncoding::from_extension("png"), None);
        assert_eq!(TileEncoding::from_extension("TOPOJSON"), None);
    }

    #[test]
    fn empty_layers_encode_in_both_formats() {
        let coord = TileCoord::new(3, 2, 1).unwrap();
        let layers = AssembledLayers::new();
        let opts = VectorTileOptions::default();

        let topo = encode(&layers, coord, TileEncoding::TopoJson, &opts).unwrap();
        assert_eq!(topo.content_type, "application/json");
        let v: Value = serde_json::from_slice(&topo.bytes).unwrap();
        assert_eq!(v["type"], "Topology");

        let mvt = encode(&layers, coord, TileEncoding::Mvt, &opts).unwrap();
        assert_eq!(mvt.content_type, "application/vnd.mapbox-vector-tile");
        assert!(mvt.bytes.is_empty());
    }
}
