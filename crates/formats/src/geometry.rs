use serde::de::{self, IgnoredAny, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Planar position `[x, y]` (lon/lat degrees or projected meters).
pub type Position = [f64; 2];

/// GeoJSON geometry. Serializes in the GeoJSON shape: `{"type", "coordinates"}`
/// for simple geometries and `{"type", "geometries"}` for collections.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Position),
    MultiPoint(Vec<Position>),
    LineString(Vec<Position>),
    MultiLineString(Vec<Vec<Position>>),
    Polygon(Vec<Vec<Position>>),
    MultiPolygon(Vec<Vec<Vec<Position>>>),
    GeometryCollection(Vec<Geometry>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryError(pub String);

impl std::fmt::Display for GeometryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid geometry: {}", self.0)
    }
}

impl std::error::Error for GeometryError {}

impl Geometry {
    /// Parses a GeoJSON geometry object. Extra ordinates (z, m) are dropped.
    pub fn from_geojson_value(value: &Value) -> Result<Self, GeometryError> {
        Geometry::deserialize(value).map_err(|e| GeometryError(e.to_string()))
    }

    pub fn from_geojson_str(payload: &str) -> Result<Self, GeometryError> {
        serde_json::from_str(payload).map_err(|e| GeometryError(e.to_string()))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Geometry::Point(_) => "Point",
            Geometry::MultiPoint(_) => "MultiPoint",
            Geometry::LineString(_) => "LineString",
            Geometry::MultiLineString(_) => "MultiLineString",
            Geometry::Polygon(_) => "Polygon",
            Geometry::MultiPolygon(_) => "MultiPolygon",
            Geometry::GeometryCollection(_) => "GeometryCollection",
        }
    }
}

/// Wire form of [`Geometry`], borrowed for writing.
#[derive(Serialize)]
#[serde(tag = "type")]
enum GeoJsonRef<'a> {
    Point { coordinates: &'a Position },
    MultiPoint { coordinates: &'a [Position] },
    LineString { coordinates: &'a [Position] },
    MultiLineString { coordinates: &'a [Vec<Position>] },
    Polygon { coordinates: &'a [Vec<Position>] },
    MultiPolygon { coordinates: &'a [Vec<Vec<Position>>] },
    GeometryCollection { geometries: &'a [Geometry] },
}

impl Serialize for Geometry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match self {
            Geometry::Point(coordinates) => GeoJsonRef::Point { coordinates },
            Geometry::MultiPoint(coordinates) => GeoJsonRef::MultiPoint { coordinates },
            Geometry::LineString(coordinates) => GeoJsonRef::LineString { coordinates },
            Geometry::MultiLineString(coordinates) => GeoJsonRef::MultiLineString { coordinates },
            Geometry::Polygon(coordinates) => GeoJsonRef::Polygon { coordinates },
            Geometry::MultiPolygon(coordinates) => GeoJsonRef::MultiPolygon { coordinates },
            Geometry::GeometryCollection(geometries) => {
                GeoJsonRef::GeometryCollection { geometries }
            }
        };
        wire.serialize(serializer)
    }
}

/// Wire form of [`Geometry`] for reading. Unknown members such as `crs` or
/// `bbox` are ignored.
#[derive(Deserialize)]
#[serde(tag = "type")]
enum GeoJson {
    Point { coordinates: Coord },
    MultiPoint { coordinates: Vec<Coord> },
    LineString { coordinates: Vec<Coord> },
    MultiLineString { coordinates: Vec<Vec<Coord>> },
    Polygon { coordinates: Vec<Vec<Coord>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Coord>>> },
    GeometryCollection { geometries: Vec<Geometry> },
}

impl<'de> Deserialize<'de> for Geometry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match GeoJson::deserialize(deserializer)? {
            GeoJson::Point { coordinates } => Geometry::Point(coordinates.0),
            GeoJson::MultiPoint { coordinates } => Geometry::MultiPoint(line(coordinates)),
            GeoJson::LineString { coordinates } => Geometry::LineString(line(coordinates)),
            GeoJson::MultiLineString { coordinates } => {
                Geometry::MultiLineString(coordinates.into_iter().map(line).collect())
            }
            GeoJson::Polygon { coordinates } => {
                Geometry::Polygon(coordinates.into_iter().map(line).collect())
            }
            GeoJson::MultiPolygon { coordinates } => Geometry::MultiPolygon(
                coordinates
                    .into_iter()
                    .map(|rings| rings.into_iter().map(line).collect())
                    .collect(),
            ),
            GeoJson::GeometryCollection { geometries } => Geometry::GeometryCollection(geometries),
        })
    }
}

fn line(coords: Vec<Coord>) -> Vec<Position> {
    coords.into_iter().map(|c| c.0).collect()
}

/// A GeoJSON position truncated to `[x, y]`.
struct Coord(Position);

impl<'de> Deserialize<'de> for Coord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CoordVisitor;

        impl<'de> Visitor<'de> for CoordVisitor {
            type Value = Coord;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a position with at least [x, y]")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Coord, A::Error> {
                let x: f64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let y: f64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                while seq.next_element::<IgnoredAny>()?.is_some() {}
                Ok(Coord([x, y]))
            }
        }

        deserializer.deserialize_seq(CoordVisitor)
    }
}
