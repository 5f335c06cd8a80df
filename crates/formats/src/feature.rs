use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::geometry::Geometry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub geometry: Geometry,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Feature {
    pub fn new(geometry: Geometry, properties: Map<String, Value>) -> Self {
        Self {
            geometry,
            properties,
        }
    }
}

/// Features of one layer, in row order.
pub type LayerResult = Vec<Feature>;

/// Every layer of a render, keyed by layer name.
///
/// This is the value the tile cache memoizes; encoders only ever see a
/// complete instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssembledLayers {
    layers: BTreeMap<String, LayerResult>,
}

impl AssembledLayers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, layer: impl Into<String>, features: LayerResult) {
        self.layers.insert(layer.into(), features);
    }

    pub fn get(&self, layer: &str) -> Option<&LayerResult> {
        self.layers.get(layer)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn feature_count(&self) -> usize {
        self.layers.values().map(Vec::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LayerResult)> {
        self.layers.iter()
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(String::as_str)
    }
}

impl FromIterator<(String, LayerResult)> for AssembledLayers {
    fn from_iter<I: IntoIterator<Item = (String, LayerResult)>>(iter: I) -> Self {
        Self {
            layers: iter.into_iter().collect(),
        }
    }
}
