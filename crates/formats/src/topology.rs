//! TopoJSON output: every layer merged into one `Topology`.
//!
//! Lines and rings become arcs in a single shared table. A coordinate run that
//! already exists, in either direction, is referenced instead of stored again
//! (reversed references use the one's complement index, `!i`). Arcs are kept
//! whole; they are not split at junctions. Coordinates are not quantized.

use std::collections::HashMap;

use serde_json::{Map, Value, json};

use crate::feature::{AssembledLayers, Feature};
use crate::geometry::{Geometry, Position};

#[derive(Debug, Default)]
struct ArcTable {
    arcs: Vec<Vec<Position>>,
    index: HashMap<Vec<[u64; 2]>, usize>,
}

fn arc_key<'a>(run: impl Iterator<Item = &'a Position>) -> Vec<[u64; 2]> {
    run.map(|p| [p[0].to_bits(), p[1].to_bits()]).collect()
}

impl ArcTable {
    /// Returns the arc reference for `run`, adding it when unseen.
    fn reference(&mut self, run: &[Position]) -> i64 {
        let forward = arc_key(run.iter());
        if let Some(&i) = self.index.get(&forward) {
            return i as i64;
        }
        let reverse = arc_key(run.iter().rev());
        if let Some(&i) = self.index.get(&reverse) {
            return !(i as i64);
        }
        let i = self.arcs.len();
        self.arcs.push(run.to_vec());
        self.index.insert(forward, i);
        i as i64
    }

    fn to_value(&self) -> Value {
        Value::Array(
            self.arcs
                .iter()
                .map(|arc| Value::Array(arc.iter().map(position_value).collect()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct BboxAccumulator {
    min: Position,
    max: Position,
    seen: bool,
}

impl BboxAccumulator {
    fn new() -> Self {
        Self {
            min: [f64::INFINITY, f64::INFINITY],
            max: [f64::NEG_INFINITY, f64::NEG_INFINITY],
            seen: false,
        }
    }

    fn add(&mut self, p: Position) {
        self.seen = true;
        self.min = [self.min[0].min(p[0]), self.min[1].min(p[1])];
        self.max = [self.max[0].max(p[0]), self.max[1].max(p[1])];
    }
}

fn position_value(p: &Position) -> Value {
    json!([p[0], p[1]])
}

/// Builds the TopoJSON document for `layers`.
///
/// Each layer becomes a `GeometryCollection` object named after the layer;
/// each feature's properties are copied through unchanged.
pub fn encode_topology(layers: &AssembledLayers) -> Value {
    let mut arcs = ArcTable::default();
    let mut bbox = BboxAccumulator::new();
    let mut objects = Map::new();

    for (name, features) in layers.iter() {
        let geometries: Vec<Value> = features
            .iter()
            .map(|feature| topo_geometry(feature, &mut arcs, &mut bbox))
            .collect();
        objects.insert(
            name.clone(),
            json!({ "type": "GeometryCollection", "geometries": geometries }),
        );
    }

    let mut root = Map::new();
    root.insert("type".to_string(), Value::String("Topology".to_string()));
    if bbox.seen {
        root.insert(
            "bbox".to_string(),
            json!([bbox.min[0], bbox.min[1], bbox.max[0], bbox.max[1]]),
        );
    }
    root.insert("objects".to_string(), Value::Object(objects));
    root.insert("arcs".to_string(), arcs.to_value());
    Value::Object(root)
}

fn topo_geometry(feature: &Feature, arcs: &mut ArcTable, bbox: &mut BboxAccumulator) -> Value {
    let mut obj = geometry_object(&feature.geometry, arcs, bbox);
    if !feature.properties.is_empty() {
        obj.insert(
            "properties".to_string(),
            Value::Object(feature.properties.clone()),
        );
    }
    Value::Object(obj)
}

fn geometry_object(
    geometry: &Geometry,
    arcs: &mut ArcTable,
    bbox: &mut BboxAccumulator,
) -> Map<String, Value> {
    let mut obj = Map::new();
    obj.insert(
        "type".to_string(),
        Value::String(geometry.type_name().to_string()),
    );

    match geometry {
        Geometry::Point(p) => {
            bbox.add(*p);
            obj.insert("coordinates".to_string(), position_value(p));
        }
        Geometry::MultiPoint(ps) => {
            ps.iter().for_each(|p| bbox.add(*p));
            obj.insert(
                "coordinates".to_string(),
                Value::Array(ps.iter().map(position_value).collect()),
            );
        }
        Geometry::LineString(ps) => {
            ps.iter().for_each(|p| bbox.add(*p));
            obj.insert("arcs".to_string(), json!([arcs.reference(ps)]));
        }
        Geometry::MultiLineString(lines) | Geometry::Polygon(lines) => {
            obj.insert("arcs".to_string(), ring_refs(lines, arcs, bbox));
        }
        Geometry::MultiPolygon(polys) => {
            let refs: Vec<Value> = polys
                .iter()
                .map(|rings| ring_refs(rings, arcs, bbox))
                .collect();
            obj.insert("arcs".to_string(), Value::Array(refs));
        }
        Geometry::GeometryCollection(members) => {
            let nested: Vec<Value> = members
                .iter()
                .map(|member| Value::Object(geometry_object(member, arcs, bbox)))
                .collect();
            obj.insert("geometries".to_string(), Value::Array(nested));
        }
    }
    obj
}

fn ring_refs(rings: &[Vec<Position>], arcs: &mut ArcTable, bbox: &mut BboxAccumulator) -> Value {
    Value::Array(
        rings
            .iter()
            .map(|ring| {
                ring.iter().for_each(|p| bbox.add(*p));
                json!([arcs.reference(ring)])
            })
            .collect(),
    )
}
