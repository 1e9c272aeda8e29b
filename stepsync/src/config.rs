//! Step and application options, and the endpoint configuration built from them.
//!
//! The host owns the options and may change them at any time between steps.
//! A handshake session copies what it needs into an [`EndpointConfig`] when it
//! starts, so later changes never affect a session already in flight.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How long the "start" request may wait for its acknowledgment.
pub const START_ACK_WAIT: Duration = Duration::from_millis(4000);

/// Receive wait used by each completion poll. Zero means "only if ready".
pub const COMPLETION_POLL_WAIT: Duration = Duration::ZERO;

/// Period of the completion poll tick.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Receive wait of the reference service loop.
pub const SERVICE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default completion timeout, in seconds.
pub const DEFAULT_TIMEOUT_SEC: f64 = 5.0;

/// Invalid option value.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ConfigError {
    #[error("timeout_sec must be a finite, non-negative number of seconds (got {0})")]
    InvalidTimeout(f64),
}

/// Per-step options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepOptions {
    /// Whether this step synchronizes with the service at all.
    pub service_enabled: bool,
    /// Completion budget, measured from the start acknowledgment.
    pub timeout_sec: f64,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            service_enabled: false,
            timeout_sec: DEFAULT_TIMEOUT_SEC,
        }
    }
}

/// Per-application options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppOptions {
    /// `tcp://host:port` of the service. Empty means no channel.
    pub service_address: String,
}

/// Snapshot of everything one handshake session needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub address: String,
    pub enabled: bool,
    pub timeout: Duration,
}

impl EndpointConfig {
    /// Combines the application and step options.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidTimeout`] if `timeout_sec` is negative,
    /// NaN, infinite or too large for a [`Duration`].
    pub fn from_options(app: &AppOptions, step: &StepOptions) -> Result<Self, ConfigError> {
        let timeout = Duration::try_from_secs_f64(step.timeout_sec)
            .map_err(|_| ConfigError::InvalidTimeout(step.timeout_sec))?;
        Ok(Self {
            address: app.service_address.trim().to_owned(),
            enabled: step.service_enabled,
            timeout,
        })
    }

    /// Whether an address is configured.
    #[must_use]
    pub const fn has_address(&self) -> bool {
        !self.address.is_empty()
    }
}

/// Source of the current options, consulted at each lifecycle hook and step.
pub trait OptionsProvider {
    fn app_options(&self) -> AppOptions;
    fn step_options(&self) -> StepOptions;
}

impl<P: OptionsProvider + ?Sized> OptionsProvider for &P {
    fn app_options(&self) -> AppOptions {
        (**self).app_options()
    }

    fn step_options(&self) -> StepOptions {
        (**self).step_options()
    }
}

impl<P: OptionsProvider + ?Sized> OptionsProvider for Rc<P> {
    fn app_options(&self) -> AppOptions {
        (**self).app_options()
    }

    fn step_options(&self) -> StepOptions {
        (**self).step_options()
    }
}

/// Options held in memory and mutable through a shared reference.
#[derive(Debug, Default)]
pub struct SharedOptions {
    app: RefCell<AppOptions>,
    step: RefCell<StepOptions>,
}

impl SharedOptions {
    #[must_use]
    pub const fn new(app: AppOptions, step: StepOptions) -> Self {
        Self {
            app: RefCell::new(app),
            step: RefCell::new(step),
        }
    }

    pub fn set_step(&self, step: StepOptions) {
        *self.step.borrow_mut() = step;
    }

    pub fn set_address(&self, address: impl Into<String>) {
        self.app.borrow_mut().service_address = address.into();
    }
}

impl OptionsProvider for SharedOptions {
    fn app_options(&self) -> AppOptions {
        self.app.borrow().clone()
    }

    fn step_options(&self) -> StepOptions {
        self.step.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let step: StepOptions = serde_json::from_str("{}").unwrap();
        assert!(!step.service_enabled);
        assert!((step.timeout_sec - 5.0).abs() < f64::EPSILON);

        let step: StepOptions = serde_json::from_str(r#"{"service_enabled": true}"#).unwrap();
        assert!(step.service_enabled);

        let app: AppOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(app.service_address, "");
    }

    #[test]
    fn options_round_trip_through_json() {
        let step = StepOptions {
            service_enabled: true,
            timeout_sec: 0.25,
        };
        let json = serde_json::to_string(&step).unwrap();
        assert_eq!(serde_json::from_str::<StepOptions>(&json).unwrap(), step);
    }

    #[test]
    fn endpoint_config_converts_timeout() {
        let app = AppOptions {
            service_address: " tcp://127.0.0.1:9999 ".into(),
        };
        let step = StepOptions {
            service_enabled: true,
            timeout_sec: 0.05,
        };
        let config = EndpointConfig::from_options(&app, &step).unwrap();
        assert_eq!(config.address, "tcp://127.0.0.1:9999");
        assert!(config.enabled);
        assert_eq!(config.timeout, Duration::from_millis(50));
        assert!(config.has_address());
    }

    #[test]
    fn invalid_timeouts_rejected() {
        let app = AppOptions::default();
        for bad in [-1.0, f64::NAN, f64::INFINITY] {
            let step = StepOptions {
                service_enabled: true,
                timeout_sec: bad,
            };
            assert!(matches!(
                EndpointConfig::from_options(&app, &step),
                Err(ConfigError::InvalidTimeout(_))
            ));
        }
    }

    #[test]
    fn zero_timeout_is_valid() {
        let step = StepOptions {
            service_enabled: true,
            timeout_sec: 0.0,
        };
        let config = EndpointConfig::from_options(&AppOptions::default(), &step).unwrap();
        assert_eq!(config.timeout, Duration::ZERO);
        assert!(!config.has_address());
    }

    #[test]
    fn shared_options_observe_updates() {
        let options = Rc::new(SharedOptions::default());
        let provider: Rc<dyn OptionsProvider> = options.clone();
        options.set_address("tcp://127.0.0.1:1");
        assert_eq!(provider.app_options().service_address, "tcp://127.0.0.1:1");
        options.set_step(StepOptions {
            service_enabled: true,
            timeout_sec: 1.0,
        });
        assert!(provider.step_options().service_enabled);
    }
}
