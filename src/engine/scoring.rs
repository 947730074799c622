use std::cmp::Ordering;

use crate::config::DispatchConfig;
use crate::models::assignment::ScoreBreakdown;
use crate::models::driver::Driver;

#[derive(Debug, Clone, Copy)]
pub struct ScoringWeights {
    pub gap: f64,
    pub proximity: f64,
    pub rating: f64,
    pub min_distance_km: f64,
}

impl From<&DispatchConfig> for ScoringWeights {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            gap: config.gap_weight,
            proximity: config.proximity_weight,
            rating: config.rating_weight,
            min_distance_km: config.min_distance_km,
        }
    }
}

/// A driver that passed every eligibility filter for one order.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub driver: Driver,
    pub distance_km: f64,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

impl Candidate {
    pub fn new(driver: Driver, distance_km: f64, weights: &ScoringWeights) -> Self {
        let (score, breakdown) = compute_score(&driver, distance_km, weights);
        Self {
            driver,
            distance_km,
            score,
            breakdown,
        }
    }
}

/// `gap·w1 + (1/distance)·w2 + rating·w3`. Drivers furthest behind their
/// daily target float up.
pub fn compute_score(driver: &Driver, distance_km: f64, weights: &ScoringWeights) -> (f64, ScoreBreakdown) {
    let breakdown = ScoreBreakdown {
        gap_score: driver.gap_from_target() as f64,
        proximity_score: 1.0 / distance_km.max(weights.min_distance_km),
        rating_score: driver.rating,
        distance_km,
    };

    let score = weighted_score(&breakdown, weights);
    (score, breakdown)
}

pub fn weighted_score(breakdown: &ScoreBreakdown, weights: &ScoringWeights) -> f64 {
    (breakdown.gap_score * weights.gap)
        + (breakdown.proximity_score * weights.proximity)
        + (breakdown.rating_score * weights.rating)
}

/// Best first. Ties go to the shorter delivery streak, then to whoever has
/// been in their current state longest.
pub fn rank(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(compare);
    candidates
}

fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| {
            a.driver
                .consecutive_deliveries
                .cmp(&b.driver.consecutive_deliveries)
        })
        .then_with(|| {
            a.driver
                .last_state_change_at
                .cmp(&b.driver.last_state_change_at)
        })
}
