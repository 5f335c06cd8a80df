//! Mapbox vector tile output: one MVT layer per assembled layer.

use std::collections::{BTreeMap, HashMap};

use foundation::TileCoord;
use foundation::math::lonlat_to_meters;
use geozero::mvt::{Message, Tile, tile};
use geozero::{GeomProcessor, GeozeroGeometry, ToMvt};
use serde_json::Value;

use crate::feature::{AssembledLayers, Feature};
use crate::geometry::{Geometry, Position};

pub const DEFAULT_EXTENT: u32 = 4096;

/// Coordinate reference of the geometries a layer's query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordinateSpace {
    /// Lon/lat degrees (EPSG:4326); projected to Web Mercator before scaling.
    #[default]
    Geographic,
    /// Web Mercator meters (EPSG:3857).
    WebMercator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorLayerOptions {
    pub extent: u32,
    pub coordinates: CoordinateSpace,
}

impl Default for VectorLayerOptions {
    fn default() -> Self {
        Self {
            extent: DEFAULT_EXTENT,
            coordinates: CoordinateSpace::Geographic,
        }
    }
}

/// Layer options by layer name; layers without an entry use `default`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorTileOptions {
    pub default: VectorLayerOptions,
    pub layers: BTreeMap<String, VectorLayerOptions>,
}

impl VectorTileOptions {
    pub fn with_layer(mut self, name: impl Into<String>, options: VectorLayerOptions) -> Self {
        self.layers.insert(name.into(), options);
        self
    }

    pub fn for_layer(&self, name: &str) -> VectorLayerOptions {
        self.layers.get(name).copied().unwrap_or(self.default)
    }
}

#[derive(Debug)]
pub struct VectorTileError {
    pub layer: String,
    pub message: String,
}

impl std::fmt::Display for VectorTileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "layer {}: {}", self.layer, self.message)
    }
}

impl std::error::Error for VectorTileError {}

/// Encodes `layers` as a protobuf vector tile for `coord`.
pub fn encode_vector_tile(
    layers: &AssembledLayers,
    coord: TileCoord,
    options: &VectorTileOptions,
) -> Result<Vec<u8>, VectorTileError> {
    let bounds = coord.bounds_meters();
    let mut tile = Tile::default();

    for (name, features) in layers.iter() {
        let opts = options.for_layer(name);
        let mut builder = LayerBuilder::new(name, opts.extent);
        for feature in features {
            let mut parts = Vec::new();
            flatten(&feature.geometry, &mut parts);
            // Collection members become separate features sharing the tags.
            for part in parts {
                let encoded = Projected {
                    geometry: part,
                    space: opts.coordinates,
                }
                .to_mvt(
                    opts.extent,
                    bounds.min[0],
                    bounds.min[1],
                    bounds.max[0],
                    bounds.max[1],
                )
                .map_err(|e| VectorTileError {
                    layer: name.clone(),
                    message: e.to_string(),
                })?;
                builder.push(encoded, feature);
            }
        }
        tile.layers.push(builder.finish());
    }

    Ok(tile.encode_to_vec())
}

fn flatten<'a>(geometry: &'a Geometry, out: &mut Vec<&'a Geometry>) {
    match geometry {
        Geometry::GeometryCollection(members) => {
            members.iter().for_each(|member| flatten(member, out))
        }
        simple => out.push(simple),
    }
}

/// A simple geometry read in `space` and fed to geozero in Web Mercator.
struct Projected<'a> {
    geometry: &'a Geometry,
    space: CoordinateSpace,
}

impl Projected<'_> {
    fn xy<P: GeomProcessor>(
        &self,
        p: Position,
        idx: usize,
        out: &mut P,
    ) -> geozero::error::Result<()> {
        let [x, y] = match self.space {
            CoordinateSpace::Geographic => lonlat_to_meters(p[0], p[1]),
            CoordinateSpace::WebMercator => p,
        };
        out.xy(x, y, idx)
    }

    fn line<P: GeomProcessor>(
        &self,
        positions: &[Position],
        tagged: bool,
        idx: usize,
        out: &mut P,
    ) -> geozero::error::Result<()> {
        out.linestring_begin(tagged, positions.len(), idx)?;
        for (i, p) in positions.iter().enumerate() {
            self.xy(*p, i, out)?;
        }
        out.linestring_end(tagged, idx)
    }

    fn polygon<P: GeomProcessor>(
        &self,
        rings: &[Vec<Position>],
        tagged: bool,
        idx: usize,
        out: &mut P,
    ) -> geozero::error::Result<()> {
        out.polygon_begin(tagged, rings.len(), idx)?;
        for (i, ring) in rings.iter().enumerate() {
            self.line(ring, false, i, out)?;
        }
        out.polygon_end(tagged, idx)
    }
}

impl GeozeroGeometry for Projected<'_> {
    fn process_geom<P: GeomProcessor>(&self, out: &mut P) -> geozero::error::Result<()> {
        match self.geometry {
            Geometry::Point(p) => {
                out.point_begin(0)?;
                self.xy(*p, 0, out)?;
                out.point_end(0)
            }
            Geometry::MultiPoint(ps) => {
                out.multipoint_begin(ps.len(), 0)?;
                for (i, p) in ps.iter().enumerate() {
                    self.xy(*p, i, out)?;
                }
                out.multipoint_end(0)
            }
            Geometry::LineString(ps) => self.line(ps, true, 0, out),
            Geometry::MultiLineString(lines) => {
                out.multilinestring_begin(lines.len(), 0)?;
                for (i, line) in lines.iter().enumerate() {
                    self.line(line, false, i, out)?;
                }
                out.multilinestring_end(0)
            }
            Geometry::Polygon(rings) => self.polygon(rings, true, 0, out),
            Geometry::MultiPolygon(polys) => {
                out.multipolygon_begin(polys.len(), 0)?;
                for (i, rings) in polys.iter().enumerate() {
                    self.polygon(rings, false, i, out)?;
                }
                out.multipolygon_end(0)
            }
            // Flattened before encoding.
            Geometry::GeometryCollection(_) => Ok(()),
        }
    }
}

/// Hashable identity of a tag value; floats compare by bit pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ValueKey {
    Bool(bool),
    Uint(u64),
    Sint(i64),
    Double(u64),
    Text(String),
}

impl ValueKey {
    fn of(value: &tile::Value) -> Self {
        if let Some(b) = value.bool_value {
            ValueKey::Bool(b)
        } else if let Some(u) = value.uint_value {
            ValueKey::Uint(u)
        } else if let Some(i) = value.sint_value {
            ValueKey::Sint(i)
        } else if let Some(d) = value.double_value {
            ValueKey::Double(d.to_bits())
        } else {
            ValueKey::Text(value.string_value.clone().unwrap_or_default())
        }
    }
}

struct LayerBuilder {
    layer: tile::Layer,
    key_index: HashMap<String, u32>,
    value_index: HashMap<ValueKey, u32>,
}

impl LayerBuilder {
    fn new(name: &str, extent: u32) -> Self {
        Self {
            layer: tile::Layer {
                version: 2,
                name: name.to_string(),
                extent: Some(extent),
                ..Default::default()
            },
            key_index: HashMap::new(),
            value_index: HashMap::new(),
        }
    }

    fn push(&mut self, mut encoded: tile::Feature, source: &Feature) {
        for (key, value) in &source.properties {
            let Some(value) = tag_value(value) else {
                continue;
            };
            let k = self.key(key);
            let v = self.value(value);
            encoded.tags.push(k);
            encoded.tags.push(v);
        }
        self.layer.features.push(encoded);
    }

    fn key(&mut self, key: &str) -> u32 {
        if let Some(&i) = self.key_index.get(key) {
            return i;
        }
        let i = self.layer.keys.len() as u32;
        self.layer.keys.push(key.to_string());
        self.key_index.insert(key.to_string(), i);
        i
    }

    fn value(&mut self, value: tile::Value) -> u32 {
        let key = ValueKey::of(&value);
        if let Some(&i) = self.value_index.get(&key) {
            return i;
        }
        let i = self.layer.values.len() as u32;
        self.layer.values.push(value);
        self.value_index.insert(key, i);
        i
    }

    fn finish(self) -> tile::Layer {
        self.layer
    }
}

/// Maps a property to a tag value. Nulls are dropped; nested values are
/// carried as their JSON text.
fn tag_value(value: &Value) -> Option<tile::Value> {
    let mut out = tile::Value::default();
    match value {
        Value::Null => return None,
        Value::Bool(b) => out.bool_value = Some(*b),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                out.uint_value = Some(u);
            } else if let Some(i) = n.as_i64() {
                out.sint_value = Some(i);
            } else {
                out.double_value = n.as_f64();
            }
        }
        Value::String(s) => out.string_value = Some(s.clone()),
        Value::Array(_) | Value::Object(_) => out.string_value = Some(value.to_string()),
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use foundation::TileCoord;
    use geozero::mvt::{Message, Tile, tile};
    use pretty_assertions::assert_eq;
    use serde_json::{Map, json};

    use super::{CoordinateSpace, VectorLayerOptions, VectorTileOptions, encode_vector_tile};
    use crate::feature::{AssembledLayers, Feature};
    use crate::geometry::Geometry;

    fn tag_pairs(layer: &tile::Layer, feature: &tile::Feature) -> Vec<(String, tile::Value)> {
        feature
            .tags
            .chunks(2)
            .map(|kv| {
                (
                    layer.keys[kv[0] as usize].clone(),
                    layer.values[kv[1] as usize].clone(),
                )
            })
            .collect()
    }

    #[test]
    fn encodes_one_layer_per_assembled_layer_with_tags() {
        let mut props = Map::new();
        props.insert("name".to_string(), json!("pier"));
        props.insert("depth".to_string(), json!(-3));
        props.insert("note".to_string(), json!(null));

        let mut layers = AssembledLayers::new();
        layers.insert(
            "poi",
            vec![
                Feature::new(Geometry::Point([0.0, 0.0]), props.clone()),
                Feature::new(Geometry::Point([10.0, 10.0]), props),
            ],
        );
        layers.insert(
            "coast",
            vec![Feature::new(
                Geometry::LineString(vec![[-10.0, -10.0], [10.0, 10.0]]),
                Map::new(),
            )],
        );

        let coord = TileCoord::new(0, 0, 0).unwrap();
        let bytes = encode_vector_tile(&layers, coord, &VectorTileOptions::default()).unwrap();
        let decoded = Tile::decode(bytes.as_slice()).unwrap();

        let names: Vec<&str> = decoded.layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["coast", "poi"]);

        let poi = &decoded.layers[1];
        assert_eq!(poi.extent, Some(4096));
        assert_eq!(poi.features.len(), 2);
        assert_eq!(poi.features[0].r#type, Some(tile::GeomType::Point as i32));
        assert!(!poi.features[0].geometry.is_empty());
        // Shared keys and values are interned once per layer.
        assert_eq!(poi.keys, vec!["depth".to_string(), "name".to_string()]);
        assert_eq!(poi.values.len(), 2);

        let tags = tag_pairs(poi, &poi.features[1]);
        assert_eq!(tags[0].0, "depth");
        assert_eq!(tags[0].1.sint_value, Some(-3));
        assert_eq!(tags[1].0, "name");
        assert_eq!(tags[1].1.string_value.as_deref(), Some("pier"));

        let coast = &decoded.layers[0];
        assert_eq!(coast.features.len(), 1);
        assert_eq!(coast.features[0].r#type, Some(tile::GeomType::Linestring as i32));
        assert!(coast.features[0].tags.is_empty());
    }

    #[test]
    fn per_layer_extent_and_coordinate_space() {
        let mut layers = AssembledLayers::new();
        layers.insert(
            "projected",
            vec![Feature::new(Geometry::Point([1000.0, 1000.0]), Map::new())],
        );
        layers.insert("empty", Vec::new());

        let options = VectorTileOptions::default().with_layer(
            "projected",
            VectorLayerOptions {
                extent: 512,
                coordinates: CoordinateSpace::WebMercator,
            },
        );
        let coord = TileCoord::new(1, 1, 0).unwrap();
        let bytes = encode_vector_tile(&layers, coord, &options).unwrap();
        let decoded = Tile::decode(bytes.as_slice()).unwrap();

        assert_eq!(decoded.layers[0].name, "empty");
        assert_eq!(decoded.layers[0].extent, Some(4096));
        assert!(decoded.layers[0].features.is_empty());
        assert_eq!(decoded.layers[1].extent, Some(512));
        assert_eq!(decoded.layers[1].features.len(), 1);
    }

    #[test]
    fn geometry_collection_members_become_features_with_shared_tags() {
        let mut props = Map::new();
        props.insert("kind".to_string(), json!("clip"));
        let mut layers = AssembledLayers::new();
        layers.insert(
            "clipped",
            vec![Feature::new(
                Geometry::GeometryCollection(vec![
                    Geometry::Point([1.0, 1.0]),
                    Geometry::GeometryCollection(vec![Geometry::LineString(vec![
                        [0.0, 0.0],
                        [5.0, 5.0],
                    ])]),
                    Geometry::Polygon(vec![vec![
                        [0.0, 0.0],
                        [4.0, 0.0],
                        [4.0, 4.0],
                        [0.0, 0.0],
                    ]]),
                ]),
                props,
            )],
        );

        let coord = TileCoord::new(0, 0, 0).unwrap();
        let bytes = encode_vector_tile(&layers, coord, &VectorTileOptions::default()).unwrap();
        let decoded = Tile::decode(bytes.as_slice()).unwrap();
        let layer = &decoded.layers[0];

        let types: Vec<Option<i32>> = layer.features.iter().map(|f| f.r#type).collect();
        assert_eq!(
            types,
            vec![
                Some(tile::GeomType::Point as i32),
                Some(tile::GeomType::Linestring as i32),
                Some(tile::GeomType::Polygon as i32),
            ]
        );
        assert_eq!(layer.keys, vec!["kind".to_string()]);
        assert_eq!(layer.values.len(), 1);
        for feature in &layer.features {
            assert_eq!(feature.tags, vec![0, 0]);
            assert!(!feature.geometry.is_empty());
        }
    }

    #[test]
    fn repeated_values_are_interned_once() {
        let features = (0..500)
            .map(|i| {
                let mut props = Map::new();
                props.insert("bucket".to_string(), json!(i % 5));
                props.insert("ratio".to_string(), json!(0.25));
                props.insert("open".to_string(), json!(i % 2 == 0));
                Feature::new(Geometry::Point([0.0, 0.0]), props)
            })
            .collect();
        let mut layers = AssembledLayers::new();
        layers.insert("dense", features);

        let coord = TileCoord::new(0, 0, 0).unwrap();
        let bytes = encode_vector_tile(&layers, coord, &VectorTileOptions::default()).unwrap();
        let decoded = Tile::decode(bytes.as_slice()).unwrap();
        let layer = &decoded.layers[0];

        assert_eq!(layer.features.len(), 500);
        // Five buckets, one ratio, two booleans.
        assert_eq!(layer.values.len(), 8);
        let ratio = tag_pairs(layer, &layer.features[499])
            .into_iter()
            .find(|(k, _)| k == "ratio")
            .unwrap();
        assert_eq!(ratio.1.double_value, Some(0.25));
    }
}
