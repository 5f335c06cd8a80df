/// Axis-aligned bounding box in a planar coordinate space.
///
/// `min` is the south-west corner and `max` the north-east corner, so for both
/// Web-Mercator meters and lon/lat degrees `max[1]` is the northern edge.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb2 {
    pub min: [f64; 2],
    pub max: [f64; 2],
}

impl Aabb2 {
    pub fn new(min: [f64; 2], max: [f64; 2]) -> Self {
        Aabb2 { min, max }
    }

    /// `[minx, miny, maxx, maxy]`, the order PostGIS and GeoJSON use.
    pub fn to_array(&self) -> [f64; 4] {
        [self.min[0], self.min[1], self.max[0], self.max[1]]
    }
}

impl std::fmt::Display for Aabb2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.min[0], self.min[1], self.max[0], self.max[1]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::Aabb2;

    #[test]
    fn display_is_comma_separated_min_then_max() {
        let b = Aabb2::new([-1.5, 2.0], [3.0, 4.25]);
        assert_eq!(b.to_string(), "-1.5,2,3,4.25");
        assert_eq!(b.to_array(), [-1.5, 2.0, 3.0, 4.25]);
    }
}
