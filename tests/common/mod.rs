#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use driver_dispatch::clock::{Clock, ManualClock};
use driver_dispatch::config::DispatchConfig;
use driver_dispatch::events::{DispatchEvent, EventKind};
use driver_dispatch::models::driver::{Driver, GeoPoint, ServiceType};
use driver_dispatch::models::order::Order;
use driver_dispatch::store::{InMemoryRepository, Repository};
use driver_dispatch::DispatchEngine;

pub const BASE: GeoPoint = GeoPoint {
    lat: 24.7136,
    lng: 46.6753,
};

pub struct Harness {
    pub engine: Arc<DispatchEngine>,
    pub repo: Arc<InMemoryRepository>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Registers a BARQ driver `offset_km` north of base and starts its shift.
    pub fn on_shift_driver(&self, name: &str, offset_km: f64) -> Driver {
        let driver = self.register(name, offset_km);
        self.engine
            .start_shift(driver.id, driver.current_location)
            .unwrap()
    }

    pub fn register(&self, name: &str, offset_km: f64) -> Driver {
        let mut driver = Driver::new(name, north_of_base(offset_km), self.now());
        driver.service_types.insert(ServiceType::Barq);
        self.engine.register_driver(driver).unwrap()
    }

    /// BARQ order picked up at base, due `minutes` from now.
    pub fn order_due_in(&self, minutes: i64) -> Order {
        Order::new(
            BASE,
            north_of_base(3.0),
            ServiceType::Barq,
            self.now() + Duration::minutes(minutes),
            self.now(),
        )
    }

    pub fn repo_order(&self, order_id: uuid::Uuid) -> Order {
        self.repo.load_order(order_id).unwrap()
    }

    pub fn repo_save(&self, order: &Order) {
        self.repo.insert_order(order).unwrap();
    }

    pub fn record(&self, kind: EventKind) -> Arc<Mutex<Vec<DispatchEvent>>> {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let writer = sink.clone();
        self.engine.subscribe(kind, move |event| {
            writer.lock().unwrap().push(event.clone());
            Ok(())
        });
        sink
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
}

pub fn harness() -> Harness {
    harness_with(DispatchConfig::default())
}

pub fn harness_with(config: DispatchConfig) -> Harness {
    let repo = Arc::new(InMemoryRepository::new());
    let clock = Arc::new(ManualClock::new(start_time()));
    let engine = DispatchEngine::builder(repo.clone())
        .config(config)
        .clock(clock.clone())
        .build()
        .unwrap();
    Harness {
        engine,
        repo,
        clock,
    }
}

/// ~`km` kilometres due north of base.
pub fn north_of_base(km: f64) -> GeoPoint {
    GeoPoint {
        lat: BASE.lat + km / 111.2,
        lng: BASE.lng,
    }
}
