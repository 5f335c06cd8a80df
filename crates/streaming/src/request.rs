use formats::TileEncoding;
use foundation::{TileContext, TileCoord};
use http::HeaderMap;

use crate::error::RenderError;

/// One validated tile request: which tile, in which encoding.
#[derive(Debug, Clone)]
pub struct TileRequest {
    pub tile: TileContext,
    pub encoding: TileEncoding,
    pub headers: HeaderMap,
}

impl TileRequest {
    pub fn new(tile: TileContext, encoding: TileEncoding, headers: HeaderMap) -> Self {
        Self {
            tile,
            encoding,
            headers,
        }
    }

    /// Parses the `<z>/<x>/<y>.<ext>` path segments of `layer`.
    ///
    /// Runs before any middleware or data-source work; every failure is an
    /// [`RenderError::InvalidRequest`].
    pub fn parse(
        layer: &str,
        z: &str,
        x: &str,
        file: &str,
        headers: HeaderMap,
    ) -> Result<Self, RenderError> {
        let (y, ext) = file
            .rsplit_once('.')
            .ok_or_else(|| RenderError::InvalidRequest(format!("{file}: missing extension")))?;
        let encoding = TileEncoding::from_extension(ext)
            .ok_or_else(|| RenderError::InvalidRequest(format!("unsupported format .{ext}")))?;

        let z: u8 = parse_index("z", z)?;
        let x: u32 = parse_index("x", x)?;
        let y: u32 = parse_index("y", y)?;
        let coord =
            TileCoord::new(z, x, y).map_err(|e| RenderError::InvalidRequest(e.to_string()))?;

        Ok(Self::new(TileContext::new(layer, coord), encoding, headers))
    }

    /// `<layer>/<z>/<x>/<y>`, used as the label of per-request stages.
    pub fn path(&self) -> String {
        format!("{}/{}", self.tile.layer, self.tile.coord)
    }
}

fn parse_index<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, RenderError> {
    raw.parse()
        .map_err(|_| RenderError::InvalidRequest(format!("{name} must be a non-negative integer, got {raw:?}")))
}

#[cfg(test)]
mod tests {
    use formats::TileEncoding;
    use http::HeaderMap;

    use super::TileRequest;
    use crate::error::RenderError;

    #[test]
    fn parses_layer_path() {
        let req = TileRequest::parse("roads", "3", "2", "5.mvt", HeaderMap::new()).unwrap();
        assert_eq!(req.encoding, TileEncoding::Mvt);
        assert_eq!((req.tile.z(), req.tile.x(), req.tile.y()), (3, 2, 5));
        assert_eq!(req.path(), "roads/3/2/5");

        let topo = TileRequest::parse("roads", "0", "0", "0.topojson", HeaderMap::new()).unwrap();
        assert_eq!(topo.encoding, TileEncoding::TopoJson);
    }

    #[test]
    fn rejects_bad_requests() {
        for (z, x, file) in [
            ("3", "2", "5.png"),
            ("3", "2", "5"),
            ("a", "2", "5.mvt"),
            ("3", "-1", "5.mvt"),
            ("1", "2", "0.mvt"),
        ] {
            let err = TileRequest::parse("roads", z, x, file, HeaderMap::new()).unwrap_err();
            assert!(
                matches!(err, RenderError::InvalidRequest(_)),
                "{z}/{x}/{file} gave {err}"
            );
        }
    }
}
