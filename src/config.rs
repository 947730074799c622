use std::env;

use crate::error::DispatchError;

/// One day; the refresh exists to run several times between daily resets.
const MAX_REFRESH_MINUTES: u64 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub log_format: LogFormat,
    pub event_buffer_size: usize,
    pub on_time_refresh_minutes: u64,
    pub dispatch: DispatchConfig,
}

/// Tunables of the dispatch core. Everything the scorer and the
/// completion path weigh lives here rather than in code.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub default_radius_km: f64,
    pub default_min_rating: f64,
    pub max_claim_attempts: u32,
    pub gap_weight: f64,
    pub proximity_weight: f64,
    pub rating_weight: f64,
    pub min_distance_km: f64,
    pub far_threshold_km: f64,
    pub average_speed_kmh: f64,
    pub typical_delivery_minutes: f64,
    pub typical_return_minutes: f64,
    pub typical_break_minutes: f64,
    pub sla_at_risk_minutes: f64,
    pub maintenance_max_retries: u32,
    pub auto_break_on_threshold: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_radius_km: 10.0,
            default_min_rating: 0.0,
            max_claim_attempts: 3,
            gap_weight: 1.0,
            proximity_weight: 2.0,
            rating_weight: 0.5,
            min_distance_km: 0.1,
            far_threshold_km: 10.0,
            average_speed_kmh: 30.0,
            typical_delivery_minutes: 30.0,
            typical_return_minutes: 15.0,
            typical_break_minutes: 30.0,
            sla_at_risk_minutes: 15.0,
            maintenance_max_retries: 5,
            auto_break_on_threshold: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            event_buffer_size: 1024,
            on_time_refresh_minutes: 15,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, DispatchError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, DispatchError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = DispatchConfig::default();

        let log_format = match lookup("LOG_FORMAT").as_deref() {
            None | Some("compact") => LogFormat::Compact,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(DispatchError::Configuration(format!(
                    "invalid LOG_FORMAT: {other}"
                )));
            }
        };

        let dispatch = DispatchConfig {
            default_radius_km: parse_or_default(&lookup, "DISPATCH_RADIUS_KM", defaults.default_radius_km)?,
            default_min_rating: parse_or_default(&lookup, "DISPATCH_MIN_RATING", defaults.default_min_rating)?,
            max_claim_attempts: parse_or_default(&lookup, "DISPATCH_MAX_CLAIM_ATTEMPTS", defaults.max_claim_attempts)?,
            gap_weight: parse_or_default(&lookup, "SCORE_GAP_WEIGHT", defaults.gap_weight)?,
            proximity_weight: parse_or_default(&lookup, "SCORE_PROXIMITY_WEIGHT", defaults.proximity_weight)?,
            rating_weight: parse_or_default(&lookup, "SCORE_RATING_WEIGHT", defaults.rating_weight)?,
            min_distance_km: parse_or_default(&lookup, "SCORE_MIN_DISTANCE_KM", defaults.min_distance_km)?,
            far_threshold_km: parse_or_default(&lookup, "FAR_THRESHOLD_KM", defaults.far_threshold_km)?,
            average_speed_kmh: parse_or_default(&lookup, "AVERAGE_SPEED_KMH", defaults.average_speed_kmh)?,
            typical_delivery_minutes: parse_or_default(&lookup, "TYPICAL_DELIVERY_MINUTES", defaults.typical_delivery_minutes)?,
            typical_return_minutes: parse_or_default(&lookup, "TYPICAL_RETURN_MINUTES", defaults.typical_return_minutes)?,
            typical_break_minutes: parse_or_default(&lookup, "TYPICAL_BREAK_MINUTES", defaults.typical_break_minutes)?,
            sla_at_risk_minutes: parse_or_default(&lookup, "SLA_AT_RISK_MINUTES", defaults.sla_at_risk_minutes)?,
            maintenance_max_retries: parse_or_default(&lookup, "MAINTENANCE_MAX_RETRIES", defaults.maintenance_max_retries)?,
            auto_break_on_threshold: parse_or_default(&lookup, "AUTO_BREAK_ON_THRESHOLD", defaults.auto_break_on_threshold)?,
        };
        dispatch.validate()?;

        let on_time_refresh_minutes = parse_or_default(&lookup, "ON_TIME_REFRESH_MINUTES", 15)?;
        if on_time_refresh_minutes == 0 || on_time_refresh_minutes > MAX_REFRESH_MINUTES {
            return Err(DispatchError::Configuration(format!(
                "ON_TIME_REFRESH_MINUTES must be between 1 and {MAX_REFRESH_MINUTES}"
            )));
        }

        Ok(Self {
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_format,
            event_buffer_size: parse_or_default(&lookup, "EVENT_BUFFER_SIZE", 1024)?,
            on_time_refresh_minutes,
            dispatch,
        })
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.max_claim_attempts == 0 {
            return Err(DispatchError::Configuration(
                "DISPATCH_MAX_CLAIM_ATTEMPTS must be > 0".to_string(),
            ));
        }
        if self.average_speed_kmh <= 0.0 {
            return Err(DispatchError::Configuration(
                "AVERAGE_SPEED_KMH must be > 0".to_string(),
            ));
        }
        if self.min_distance_km <= 0.0 {
            return Err(DispatchError::Configuration(
                "SCORE_MIN_DISTANCE_KM must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or_default<F, T>(lookup: &F, key: &str, default: T) -> Result<T, DispatchError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|err| DispatchError::Configuration(format!("invalid {key}: {err}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{Config, LogFormat};

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Compact);
        assert_eq!(config.dispatch.max_claim_attempts, 3);
        assert_eq!(config.dispatch.far_threshold_km, 10.0);
        assert_eq!(config.on_time_refresh_minutes, 15);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("LOG_FORMAT", "json"),
            ("SCORE_GAP_WEIGHT", "3.5"),
            ("DISPATCH_MAX_CLAIM_ATTEMPTS", "7"),
            ("AUTO_BREAK_ON_THRESHOLD", "true"),
        ]))
        .unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.dispatch.gap_weight, 3.5);
        assert_eq!(config.dispatch.max_claim_attempts, 7);
        assert!(config.dispatch.auto_break_on_threshold);
    }

    #[test]
    fn malformed_value_is_a_configuration_error() {
        let err = Config::from_lookup(lookup(&[("FAR_THRESHOLD_KM", "far")])).unwrap_err();
        assert_eq!(err.kind(), "configuration");
        assert!(err.to_string().contains("FAR_THRESHOLD_KM"));
    }

    #[test]
    fn refresh_period_must_fit_within_a_day() {
        assert!(Config::from_lookup(lookup(&[("ON_TIME_REFRESH_MINUTES", "0")])).is_err());
        let err = Config::from_lookup(lookup(&[(
            "ON_TIME_REFRESH_MINUTES",
            "18446744073709551615",
        )]))
        .unwrap_err();
        assert_eq!(err.kind(), "configuration");

        let config = Config::from_lookup(lookup(&[("ON_TIME_REFRESH_MINUTES", "1440")])).unwrap();
        assert_eq!(config.on_time_refresh_minutes, 1440);
    }

    #[test]
    fn zero_claim_attempts_is_rejected() {
        assert!(Config::from_lookup(lookup(&[("DISPATCH_MAX_CLAIM_ATTEMPTS", "0")])).is_err());
    }
}
