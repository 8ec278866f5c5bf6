//! Named one-shot and repeating timers.

use crate::duration::{parse_duration, to_std};
use crate::error::{Result, RuleError};
use crate::ids::{CorrelationId, TimerId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Repeat settings for a timer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatConfig {
    /// Interval between fires, duration grammar.
    pub interval: Value,

    /// Maximum total number of fires; unlimited when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<u32>,
}

/// Event emitted when a timer expires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpireSpec {
    /// Topic of the emitted event.
    pub topic: String,

    /// Payload of the emitted event.
    #[serde(default)]
    pub data: Value,
}

/// Caller-supplied timer definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerConfig {
    /// External timer name; setting a name again replaces the instance.
    pub name: String,

    /// Delay before the first fire, duration grammar.
    pub duration: Value,

    /// Optional repetition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatConfig>,

    /// Event to emit on expiry.
    pub on_expire: ExpireSpec,
}

impl TimerConfig {
    /// Validate the definition.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RuleError::validation("timer name must not be empty"));
        }
        if self.on_expire.topic.trim().is_empty() {
            return Err(RuleError::validation(format!(
                "timer {}: expiry topic must not be empty",
                self.name
            )));
        }
        parse_duration(&self.duration).map_err(|e| {
            RuleError::validation(format!("timer {}: invalid duration: {e}", self.name))
        })?;
        if let Some(repeat) = &self.repeat {
            parse_duration(&repeat.interval).map_err(|e| {
                RuleError::validation(format!(
                    "timer {}: invalid repeat interval: {e}",
                    self.name
                ))
            })?;
            if repeat.max_count == Some(0) {
                return Err(RuleError::validation(format!(
                    "timer {}: repeat max_count must be positive",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// An active timer instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    /// Instance identifier; a replacement under the same name gets a new id.
    pub id: TimerId,

    /// External timer name.
    pub name: String,

    /// Next expiry time.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,

    /// Repeat settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatConfig>,

    /// Event to emit on expiry.
    pub on_expire: ExpireSpec,

    /// Correlation id threaded into expiry events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

/// Delivered to the engine when a timer fires.
#[derive(Debug, Clone)]
pub struct TimerFired {
    /// The timer at the moment of the fire.
    pub timer: Timer,

    /// 1-based fire counter for repeating timers.
    pub fire_count: u32,
}

struct ActiveTimer {
    timer: Timer,
    handle: JoinHandle<()>,
}

type FireCallback = Arc<dyn Fn(TimerFired) + Send + Sync>;

/// Manages named timers and posts fires to the engine queue.
pub struct TimerManager {
    timers: Arc<Mutex<HashMap<String, ActiveTimer>>>,
    callback: FireCallback,
    stopped: Arc<AtomicBool>,
}

impl TimerManager {
    /// Create a manager delivering fires through the callback.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(TimerFired) + Send + Sync + 'static,
    {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            callback: Arc::new(callback),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set a timer, replacing any existing timer with the same name.
    pub fn set_timer(
        &self,
        config: TimerConfig,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Timer> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RuleError::Shutdown);
        }
        config.validate()?;

        let initial = parse_duration(&config.duration)?;
        let interval = config
            .repeat
            .as_ref()
            .map(|r| parse_duration(&r.interval))
            .transpose()?;
        let max_count = config.repeat.as_ref().and_then(|r| r.max_count);

        let timer = Timer {
            id: TimerId::new(),
            name: config.name.clone(),
            expires_at: Utc::now() + initial,
            repeat: config.repeat.clone(),
            on_expire: config.on_expire.clone(),
            correlation_id,
        };

        let timers = Arc::clone(&self.timers);
        let callback = Arc::clone(&self.callback);
        let stopped = Arc::clone(&self.stopped);
        let task_timer = timer.clone();
        let name = config.name.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(to_std(initial)).await;
            let mut fire_count: u32 = 1;
            fire(&timers, &callback, &stopped, &task_timer, fire_count, interval);

            if let Some(interval) = interval {
                while max_count.map_or(true, |max| fire_count < max) {
                    tokio::time::sleep(to_std(interval)).await;
                    fire_count += 1;
                    fire(&timers, &callback, &stopped, &task_timer, fire_count, Some(interval));
                }
            }

            // Self-removal, unless a replacement already took the name.
            let mut map = timers.lock();
            if map
                .get(&task_timer.name)
                .map(|active| active.timer.id == task_timer.id)
                .unwrap_or(false)
            {
                map.remove(&task_timer.name);
            }
        });

        let mut map = self.timers.lock();
        if let Some(previous) = map.insert(
            name.clone(),
            ActiveTimer {
                timer: timer.clone(),
                handle,
            },
        ) {
            previous.handle.abort();
            debug!("Replaced timer {}", name);
        } else {
            debug!("Set timer {}", name);
        }

        Ok(timer)
    }

    /// Cancel a timer by name, returning the cancelled instance.
    pub fn cancel_timer(&self, name: &str) -> Option<Timer> {
        let removed = self.timers.lock().remove(name);
        removed.map(|active| {
            active.handle.abort();
            debug!("Cancelled timer {}", name);
            active.timer
        })
    }

    /// Get a timer by name.
    pub fn get_timer(&self, name: &str) -> Option<Timer> {
        self.timers.lock().get(name).map(|active| active.timer.clone())
    }

    /// All active timers.
    pub fn get_all(&self) -> Vec<Timer> {
        self.timers
            .lock()
            .values()
            .map(|active| active.timer.clone())
            .collect()
    }

    /// Number of active timers.
    pub fn len(&self) -> usize {
        self.timers.lock().len()
    }

    /// Whether no timers are active.
    pub fn is_empty(&self) -> bool {
        self.timers.lock().is_empty()
    }

    /// Cancel all timers and refuse further work. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut map = self.timers.lock();
        for (_, active) in map.drain() {
            active.handle.abort();
        }
        info!("Timer manager stopped");
    }
}

fn fire(
    timers: &Arc<Mutex<HashMap<String, ActiveTimer>>>,
    callback: &FireCallback,
    stopped: &Arc<AtomicBool>,
    timer: &Timer,
    fire_count: u32,
    interval: Option<chrono::Duration>,
) {
    if stopped.load(Ordering::SeqCst) {
        return;
    }

    // Keep the published expiry current for repeating timers.
    if let Some(interval) = interval {
        let mut map = timers.lock();
        if let Some(active) = map.get_mut(&timer.name) {
            if active.timer.id == timer.id {
                active.timer.expires_at = Utc::now() + interval;
            }
        }
    }

    callback(TimerFired {
        timer: timer.clone(),
        fire_count,
    });
}
