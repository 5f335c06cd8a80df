//! The `addresses` demo layer: address points sampled by zoom so low zooms
//! stay light.

use streaming::LayerDefinition;

pub const ADDRESSES_LAYER: &str = "addresses";

/// Fraction of rows kept at zoom `z`.
pub fn sample_rate(z: u8) -> f64 {
    match z {
        0..=11 => 0.1,
        12..=13 => 0.25,
        14..=15 => 0.5,
        _ => 1.0,
    }
}

pub fn addresses_sql(z: u8) -> String {
    format!(
        "SELECT ST_AsGeoJSON(the_geom) AS the_geom_geojson \
         FROM oa \
         WHERE ST_Intersects(the_geom, !bbox_4326!) \
         AND random() < {}",
        sample_rate(z)
    )
}

pub fn addresses_layer() -> LayerDefinition {
    LayerDefinition::new(ADDRESSES_LAYER, |tile, render| async move {
        if let Err(err) = render.query(addresses_sql(tile.z())) {
            tracing::warn!(error = %err, "addresses query rejected");
        }
    })
}
