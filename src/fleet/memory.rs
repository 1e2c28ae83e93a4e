//! 内存车队：种子车辆 + 预约表（按幂等键存储）

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::core::{Ambulance, Coordinates};
use crate::fleet::geo::{eta_minutes, haversine_km, round2};
use crate::fleet::{AmbulanceBackend, BackendError, BookingConfirmation, BookingRequest};

/// 车队中的一辆车
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetUnit {
    pub id: String,
    pub driver: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

impl FleetUnit {
    pub fn new(id: &str, driver: &str, lat: f64, lon: f64, available: bool) -> Self {
        Self {
            id: id.to_string(),
            driver: driver.to_string(),
            lat,
            lon,
            available,
        }
    }

    fn position(&self) -> Coordinates {
        Coordinates::new(self.lat, self.lon)
    }
}

/// 默认种子车辆
pub fn default_units() -> Vec<FleetUnit> {
    vec![
        FleetUnit::new("amb-1", "Alice", 12.9330, 77.6100, true),
        FleetUnit::new("amb-2", "Bob", 12.9350, 77.6120, true),
        FleetUnit::new("amb-3", "Charlie", 12.9200, 77.6000, false),
        FleetUnit::new("amb-4", "David", 12.9400, 77.6200, true),
    ]
}

#[derive(Debug, Clone)]
struct StoredBooking {
    ambulance_id: String,
    confirmation: BookingConfirmation,
}

#[derive(Debug)]
struct FleetState {
    units: Vec<FleetUnit>,
    /// idempotency_key -> 预约
    bookings: HashMap<String, StoredBooking>,
    next_booking: u64,
}

#[derive(Debug)]
pub struct InMemoryFleet {
    seed: Vec<FleetUnit>,
    speed_kmph: f64,
    max_distance_km: f64,
    state: Mutex<FleetState>,
}

impl InMemoryFleet {
    pub fn new(units: Vec<FleetUnit>, speed_kmph: f64, max_distance_km: f64) -> Self {
        Self {
            seed: units.clone(),
            speed_kmph,
            max_distance_km,
            state: Mutex::new(FleetState {
                units,
                bookings: HashMap::new(),
                next_booking: 1,
            }),
        }
    }

    /// 默认种子车辆，40 km/h，50 km 半径
    pub fn seeded() -> Self {
        Self::new(default_units(), 40.0, 50.0)
    }

    /// 已创建的预约数（重放不计）
    pub async fn booking_count(&self) -> usize {
        self.state.lock().await.bookings.len()
    }

    pub async fn is_available(&self, ambulance_id: &str) -> Option<bool> {
        let state = self.state.lock().await;
        state
            .units
            .iter()
            .find(|u| u.id == ambulance_id)
            .map(|u| u.available)
    }

    /// 恢复种子可用性并清空预约
    pub async fn release_all(&self) {
        let mut state = self.state.lock().await;
        state.units = self.seed.clone();
        state.bookings.clear();
        state.next_booking = 1;
        tracing::info!("fleet reset: bookings cleared");
    }
}

#[async_trait]
impl AmbulanceBackend for InMemoryFleet {
    async fn find_nearby(&self, at: Coordinates) -> Result<Vec<Ambulance>, BackendError> {
        let state = self.state.lock().await;
        let mut seen = Vec::new();
        let mut nearby = Vec::new();
        for unit in state.units.iter().filter(|u| u.available) {
            let distance = round2(haversine_km(at, unit.position()));
            if distance > self.max_distance_km {
                continue;
            }
            // 同一司机同一距离只保留一条
            let key = (unit.driver.clone(), (distance * 100.0).round() as i64);
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            nearby.push(Ambulance {
                id: unit.id.clone(),
                distance_km: distance,
                eta_min: eta_minutes(distance, self.speed_kmph).unwrap_or(u32::MAX),
                available: unit.available,
            });
        }
        nearby.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
        tracing::debug!(count = nearby.len(), "nearby ambulances");
        Ok(nearby)
    }

    async fn book(&self, request: &BookingRequest) -> Result<BookingConfirmation, BackendError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.bookings.get(&request.idempotency_key) {
            if existing.ambulance_id != request.ambulance_id {
                return Err(BackendError::Rejected(format!(
                    "idempotency key {} already used for {}",
                    request.idempotency_key, existing.ambulance_id
                )));
            }
            tracing::info!(key = %request.idempotency_key, "booking replayed");
            return Ok(existing.confirmation.clone());
        }

        let unit = state
            .units
            .iter_mut()
            .find(|u| u.id == request.ambulance_id)
            .ok_or_else(|| {
                BackendError::Rejected(format!("Ambulance with ID {} not found", request.ambulance_id))
            })?;
        if !unit.available {
            return Err(BackendError::Rejected(format!(
                "Ambulance with ID {} is not available",
                request.ambulance_id
            )));
        }
        unit.available = false;

        let booking_id = format!("bk-{}", state.next_booking);
        state.next_booking += 1;
        let confirmation = BookingConfirmation {
            booking_id,
            confirmed: true,
        };
        state.bookings.insert(
            request.idempotency_key.clone(),
            StoredBooking {
                ambulance_id: request.ambulance_id.clone(),
                confirmation: confirmation.clone(),
            },
        );
        tracing::info!(
            session = %request.session_id,
            ambulance = %request.ambulance_id,
            booking = %confirmation.booking_id,
            "ambulance booked"
        );
        Ok(confirmation)
    }
}
