//! Tile addressing and the per-request Tile Context.
//!
//! A tile `(z, x, y)` covers `[x/2^z, (x+1)/2^z] × [y/2^z, (y+1)/2^z]` of the
//! unit square (XYZ scheme, y grows south). The context carries the projected
//! and geographic boxes plus SQL fragments that templates splice in by name.

use crate::bounds::Aabb2;
use crate::math::{meters_to_lonlat, unit_to_meters};

/// Deepest zoom accepted; `2^z` must fit the `u32` tile indices.
pub const MAX_ZOOM: u8 = 30;

/// Tile coordinate in ZXY scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileError {
    ZoomTooDeep { z: u8, max: u8 },
    OutOfRange { z: u8, x: u32, y: u32 },
}

impl std::fmt::Display for TileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TileError::ZoomTooDeep { z, max } => write!(f, "zoom {z} exceeds maximum {max}"),
            TileError::OutOfRange { z, x, y } => {
                write!(f, "tile {z}/{x}/{y} is outside the zoom level grid")
            }
        }
    }
}

impl std::error::Error for TileError {}

impl TileCoord {
    pub fn new(z: u8, x: u32, y: u32) -> Result<Self, TileError> {
        if z > MAX_ZOOM {
            return Err(TileError::ZoomTooDeep { z, max: MAX_ZOOM });
        }
        let n = 1u64 << z;
        if x as u64 >= n || y as u64 >= n {
            return Err(TileError::OutOfRange { z, x, y });
        }
        Ok(Self { z, x, y })
    }

    /// Web-Mercator bounds in meters (EPSG:3857).
    pub fn bounds_meters(&self) -> Aabb2 {
        let n = (1u64 << self.z) as f64;
        let nw = unit_to_meters(self.x as f64 / n, self.y as f64 / n);
        let se = unit_to_meters((self.x as f64 + 1.0) / n, (self.y as f64 + 1.0) / n);
        Aabb2::new([nw[0], se[1]], [se[0], nw[1]])
    }

    /// Geographic bounds in degrees (EPSG:4326).
    pub fn bounds_lonlat(&self) -> Aabb2 {
        let m = self.bounds_meters();
        let sw = meters_to_lonlat(m.min[0], m.min[1]);
        let ne = meters_to_lonlat(m.max[0], m.max[1]);
        Aabb2::new(sw, ne)
    }
}

impl std::fmt::Display for TileCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Immutable description of the tile being rendered, one per request.
#[derive(Debug, Clone, PartialEq)]
pub struct TileContext {
    pub layer: String,
    pub coord: TileCoord,
    /// Projected box, meters.
    pub bounds: Aabb2,
    /// Geographic box, degrees.
    pub bounds_4326: Aabb2,
    /// PostGIS expression building the projected box.
    pub bbox: String,
    /// PostGIS expression for the box transformed to EPSG:4326.
    pub bbox_4326: String,
    /// PostGIS expression hashing `the_geom`, for stable feature ids.
    pub geom_hash: String,
}

impl TileContext {
    pub fn new(layer: impl Into<String>, coord: TileCoord) -> Self {
        let bounds = coord.bounds_meters();
        let bbox = format!(
            "ST_SetSRID(ST_MakeBox2D(ST_MakePoint({}, {}), ST_MakePoint({}, {})), 3857)",
            bounds.min[0], bounds.min[1], bounds.max[0], bounds.max[1]
        );
        let bbox_4326 = format!("ST_Transform({bbox}, 4326)");
        Self {
            layer: layer.into(),
            coord,
            bounds,
            bounds_4326: coord.bounds_lonlat(),
            bbox,
            bbox_4326,
            geom_hash: "Substr(MD5(ST_AsBinary(the_geom)), 1, 10)".to_string(),
        }
    }

    pub fn z(&self) -> u8 {
        self.coord.z
    }

    pub fn x(&self) -> u32 {
        self.coord.x
    }

    pub fn y(&self) -> u32 {
        self.coord.y
    }

    /// String form of a named field, as substituted into `!name!` placeholders.
    pub fn token(&self, name: &str) -> Option<String> {
        let value = match name {
            "layer" => self.layer.clone(),
            "x" => self.coord.x.to_string(),
            "y" => self.coord.y.to_string(),
            "z" => self.coord.z.to_string(),
            "bounds" => self.bounds.to_string(),
            "bounds_4326" => self.bounds_4326.to_string(),
            "bbox" => self.bbox.clone(),
            "bbox_4326" => self.bbox_4326.clone(),
            "geom_hash" => self.geom_hash.clone(),
            _ => return None,
        };
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{TileContext, TileCoord, TileError};
    use crate::math::{MAX_LATITUDE_DEG, ORIGIN_SHIFT_M};

    fn assert_close(a: f64, b: f64, eps: f64) {
        let diff = (a - b).abs();
        assert!(diff <= eps, "expected {a} ~= {b} (diff {diff})");
    }

    #[test]
    fn zoom_zero_covers_projected_world() {
        let b = TileCoord::new(0, 0, 0).unwrap().bounds_meters();
        assert_eq!(b.to_array(), [-ORIGIN_SHIFT_M, -ORIGIN_SHIFT_M, ORIGIN_SHIFT_M, ORIGIN_SHIFT_M]);

        let g = TileCoord::new(0, 0, 0).unwrap().bounds_lonlat();
        assert_close(g.min[0], -180.0, 1e-9);
        assert_close(g.max[0], 180.0, 1e-9);
        assert_close(g.max[1], MAX_LATITUDE_DEG, 1e-9);
        assert_close(g.min[1], -MAX_LATITUDE_DEG, 1e-9);
    }

    #[test]
    fn zoom_one_origin_is_north_west_quadrant() {
        let b = TileCoord::new(1, 0, 0).unwrap().bounds_meters();
        assert_eq!(b.to_array(), [-ORIGIN_SHIFT_M, 0.0, 0.0, ORIGIN_SHIFT_M]);

        let g = TileCoord::new(1, 0, 0).unwrap().bounds_lonlat();
        assert_close(g.min[0], -180.0, 1e-9);
        assert_close(g.max[0], 0.0, 1e-9);
        assert_close(g.min[1], 0.0, 1e-9);
    }

    #[test]
    fn rejects_coordinates_outside_grid() {
        assert_eq!(
            TileCoord::new(2, 4, 0),
            Err(TileError::OutOfRange { z: 2, x: 4, y: 0 })
        );
        assert!(TileCoord::new(31, 0, 0).is_err());
        assert!(TileCoord::new(30, (1 << 30) - 1, 0).is_ok());
    }

    #[test]
    fn tokens_expose_fields_and_fragments() {
        let tile = TileContext::new("roads", TileCoord::new(3, 2, 5).unwrap());
        assert_eq!(tile.token("layer").as_deref(), Some("roads"));
        assert_eq!(tile.token("z").as_deref(), Some("3"));
        assert_eq!(tile.token("x").as_deref(), Some("2"));
        assert_eq!(tile.token("y").as_deref(), Some("5"));
        assert!(tile.bbox.starts_with("ST_SetSRID(ST_MakeBox2D(ST_MakePoint("));
        assert!(tile.bbox.ends_with(", 3857)"));
        assert_eq!(tile.bbox_4326, format!("ST_Transform({}, 4326)", tile.bbox));
        assert_eq!(tile.token("nope"), None);
    }
}
