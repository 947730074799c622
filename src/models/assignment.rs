use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::driver::Driver;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub gap_score: f64,
    pub proximity_score: f64,
    pub rating_score: f64,
    pub distance_km: f64,
}

/// Outcome of a successful dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub order_id: Uuid,
    pub driver: Driver,
    pub score: f64,
    pub score_breakdown: ScoreBreakdown,
    pub eta_to_pickup_minutes: f64,
    pub claim_attempts: u32,
    pub assigned_at: DateTime<Utc>,
}
