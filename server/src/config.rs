//! Server configuration.

use shared::{Vector2, HOME_AREA, HOME_SPAWN, SNAP_THRESHOLD, TICK_RATE, WALK_SPEED};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, ServerError};

/// Environment variable holding the token signing secret.
pub const AUTH_SECRET_ENV: &str = "PLAZA_AUTH_SECRET";

/// Idle sessions older than this are evicted.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// How often the housekeeper looks for idle sessions.
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub tick_rate: u32,
    pub walk_speed: f64,
    pub snap_threshold: f64,
    pub max_clients: usize,
    pub idle_timeout: Duration,
    pub housekeeping_interval: Duration,
    pub home_area: String,
    /// Spawn point per area; areas not listed use `default_spawn`.
    pub spawn_points: HashMap<String, Vector2>,
    pub default_spawn: Vector2,
    pub auth_secret: String,
    pub store_fixture: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mut spawn_points = HashMap::new();
        spawn_points.insert(HOME_AREA.to_string(), HOME_SPAWN);

        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            tick_rate: TICK_RATE,
            walk_speed: WALK_SPEED,
            snap_threshold: SNAP_THRESHOLD,
            max_clients: 256,
            idle_timeout: IDLE_TIMEOUT,
            housekeeping_interval: HOUSEKEEPING_INTERVAL,
            home_area: HOME_AREA.to_string(),
            spawn_points,
            default_spawn: HOME_SPAWN,
            auth_secret: String::new(),
            store_fixture: None,
        }
    }
}

impl ServerConfig {
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate as f64)
    }

    pub fn spawn_point(&self, area: &str) -> Vector2 {
        self.spawn_points
            .get(area)
            .copied()
            .unwrap_or(self.default_spawn)
    }

    /// Checks everything that must hold before the server accepts connections.
    pub fn validate(&self) -> Result<()> {
        if self.auth_secret.trim().is_empty() {
            return Err(ServerError::Config(format!(
                "auth secret is missing (set {} or pass --auth-secret)",
                AUTH_SECRET_ENV
            )));
        }
        if self.tick_rate == 0 || self.tick_rate > 1000 {
            return Err(ServerError::Config(format!(
                "tick rate {} out of range 1..=1000",
                self.tick_rate
            )));
        }
        if !(self.walk_speed.is_finite() && self.walk_speed > 0.0) {
            return Err(ServerError::Config("walk speed must be positive".into()));
        }
        if self.max_clients == 0 {
            return Err(ServerError::Config("max clients must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ServerConfig {
        ServerConfig {
            auth_secret: "secret".to_string(),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let config = ServerConfig::default();
        assert_eq!(config.tick_rate, 60);
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.home_area, "home");
        assert_eq!(config.spawn_point("home"), Vector2::new(690.0, 385.0));
    }

    #[test]
    fn test_unknown_area_uses_default_spawn() {
        let mut config = valid_config();
        config.default_spawn = Vector2::new(1.0, 2.0);
        assert_eq!(config.spawn_point("beach"), Vector2::new(1.0, 2.0));
    }

    #[test]
    fn test_missing_secret_is_fatal() {
        let config = ServerConfig::default();
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));

        let blank = ServerConfig {
            auth_secret: "   ".to_string(),
            ..ServerConfig::default()
        };
        assert!(blank.validate().is_err());

        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_tick_rate_bounds() {
        let config = ServerConfig {
            tick_rate: 0,
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tick_duration() {
        let config = valid_config();
        let millis = config.tick_duration().as_secs_f64() * 1000.0;
        assert!((millis - 1000.0 / 60.0).abs() < 0.001);
    }
}
