//! Recurring task schedule definitions.
//!
//! A schedule block looks like:
//!
//! ```json
//! { "frequency": { "minutes": 30 }, "timeout": { "minutes": 3 }, "initialDelay": { "seconds": 15 } }
//! ```

use std::time::Duration;

use super::reader::{ConfigReadError, ConfigReader};

const DURATION_UNITS: &[(&str, f64)] = &[
    ("days", 86_400_000.0),
    ("hours", 3_600_000.0),
    ("minutes", 60_000.0),
    ("seconds", 1_000.0),
    ("milliseconds", 1.0),
];

/// How often a recurring task runs and how long one invocation may take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleDefinition {
    pub frequency: Duration,
    pub timeout: Duration,
    pub initial_delay: Option<Duration>,
}

impl ScheduleDefinition {
    pub fn new(frequency: Duration, timeout: Duration) -> Self {
        Self {
            frequency,
            timeout,
            initial_delay: None,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }
}

/// Reads a schedule block. `frequency` and `timeout` are required and must be positive.
pub fn read_schedule_definition(config: &ConfigReader) -> Result<ScheduleDefinition, ConfigReadError> {
    let frequency = read_duration(&config.get_config("frequency")?)?;
    let timeout = read_duration(&config.get_config("timeout")?)?;
    let initial_delay = config
        .get_optional_config("initialDelay")?
        .map(|delay| read_duration(&delay))
        .transpose()?;

    for (key, value) in [("frequency", frequency), ("timeout", timeout)] {
        if value.is_zero() {
            return Err(ConfigReadError::Invalid {
                key: config.full_key(key),
                message: "duration must be greater than zero".to_string(),
            });
        }
    }

    Ok(ScheduleDefinition {
        frequency,
        timeout,
        initial_delay,
    })
}

/// Reads a human duration object such as `{ "hours": 1, "minutes": 30 }`.
pub fn read_duration(config: &ConfigReader) -> Result<Duration, ConfigReadError> {
    if let Some(unknown) = config
        .keys()
        .into_iter()
        .find(|key| !DURATION_UNITS.iter().any(|(unit, _)| *unit == key.as_str()))
    {
        return Err(ConfigReadError::Invalid {
            key: config.full_key(&unknown),
            message: format!(
                "unknown duration unit, expected one of {}",
                DURATION_UNITS
                    .iter()
                    .map(|(unit, _)| *unit)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        });
    }

    let mut total_ms = 0.0;
    let mut seen_any = false;
    for &(unit, multiplier) in DURATION_UNITS {
        if let Some(amount) = config.get_optional_number(unit)? {
            if !amount.is_finite() || amount < 0.0 {
                return Err(ConfigReadError::Invalid {
                    key: config.full_key(unit),
                    message: format!("expected a non-negative number, got {amount}"),
                });
            }
            total_ms += amount * multiplier;
            seen_any = true;
        }
    }

    if !seen_any {
        return Err(ConfigReadError::Invalid {
            key: config.path().to_string(),
            message: "duration needs at least one unit".to_string(),
        });
    }

    Ok(Duration::from_millis(total_ms.round() as u64))
}
