//! 距离与到达时间估算

use crate::core::Coordinates;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// 两点间大圆距离（km）
pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// ETA（分钟）：round(distance / speed * 60)，至少 1 分钟；速度非正时返回 None
pub fn eta_minutes(distance_km: f64, speed_kmph: f64) -> Option<u32> {
    if speed_kmph <= 0.0 || !distance_km.is_finite() {
        return None;
    }
    let minutes = (distance_km / speed_kmph * 60.0).round();
    Some((minutes as u32).max(1))
}

pub(crate) fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_distance() {
        let p = Coordinates::new(12.9335, 77.6105);
        assert!(haversine_km(p, p).abs() < 1e-9);
    }

    #[test]
    fn test_one_degree_latitude() {
        let d = haversine_km(Coordinates::new(0.0, 0.0), Coordinates::new(1.0, 0.0));
        assert!((d - 111.19).abs() < 0.01, "got {d}");
    }

    #[test]
    fn test_eta() {
        assert_eq!(eta_minutes(10.0, 40.0), Some(15));
        assert_eq!(eta_minutes(0.05, 40.0), Some(1));
        assert_eq!(eta_minutes(1.0, 0.0), None);
    }
}
