use std::f64::consts::PI;

/// Sphere radius used by spherical (Web) Mercator, EPSG:3857 (meters).
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;
/// Half the projected world width: `PI * EARTH_RADIUS_M`.
pub const ORIGIN_SHIFT_M: f64 = PI * EARTH_RADIUS_M;
/// Latitude limit of the square Web-Mercator world.
pub const MAX_LATITUDE_DEG: f64 = 85.051_128_779_806_59;

/// Projects lon/lat degrees to Web-Mercator meters.
///
/// Latitude is clamped to the Mercator limit so poles stay finite.
pub fn lonlat_to_meters(lon_deg: f64, lat_deg: f64) -> [f64; 2] {
    let lat = lat_deg.clamp(-MAX_LATITUDE_DEG, MAX_LATITUDE_DEG);
    let x = lon_deg.to_radians() * EARTH_RADIUS_M;
    let y = (PI / 4.0 + lat.to_radians() / 2.0).tan().ln() * EARTH_RADIUS_M;
    [x, y]
}

/// Inverse of [`lonlat_to_meters`].
pub fn meters_to_lonlat(x: f64, y: f64) -> [f64; 2] {
    let lon = (x / EARTH_RADIUS_M).to_degrees();
    let lat = (2.0 * (y / EARTH_RADIUS_M).exp().atan() - PI / 2.0).to_degrees();
    [lon, lat]
}

/// Maps a point of the unit square (origin top-left, y growing south) to
/// Web-Mercator meters.
pub fn unit_to_meters(u: f64, v: f64) -> [f64; 2] {
    let x = u * 2.0 * ORIGIN_SHIFT_M - ORIGIN_SHIFT_M;
    let y = ORIGIN_SHIFT_M - v * 2.0 * ORIGIN_SHIFT_M;
    [x, y]
}
