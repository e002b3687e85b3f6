//! System-state snapshots: the measurements the policy engine reads.
//!
//! Whichever subsystem observes a new value for an entity records it here;
//! the previous value, trend direction, rolling average and a bounded trend
//! history are maintained as bookkeeping on every observation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TelosError};
use crate::store::UnitOfWork;

/// Trend history is bounded; old points fall off the front.
pub const TREND_HISTORY_CAP: usize = 32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Metric,
    Strategy,
    Resource,
    Risk,
    Hypothesis,
    Constraint,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Metric => "metric",
            EntityType::Strategy => "strategy",
            EntityType::Resource => "resource",
            EntityType::Risk => "risk",
            EntityType::Hypothesis => "hypothesis",
            EntityType::Constraint => "constraint",
        }
    }
}

impl std::str::FromStr for EntityType {
    type Err = TelosError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "metric" => Ok(EntityType::Metric),
            "strategy" => Ok(EntityType::Strategy),
            "resource" => Ok(EntityType::Resource),
            "risk" => Ok(EntityType::Risk),
            "hypothesis" => Ok(EntityType::Hypothesis),
            "constraint" => Ok(EntityType::Constraint),
            other => Err(TelosError::InvalidOperation(format!(
                "unknown entity type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Degrading,
}

impl TrendDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Improving => "improving",
            TrendDirection::Stable => "stable",
            TrendDirection::Degrading => "degrading",
        }
    }
}

impl std::str::FromStr for TrendDirection {
    type Err = TelosError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "improving" => Ok(TrendDirection::Improving),
            "stable" => Ok(TrendDirection::Stable),
            "degrading" => Ok(TrendDirection::Degrading),
            other => Err(TelosError::InvalidOperation(format!(
                "unknown trend direction: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendPoint {
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStateEntity {
    pub entity_name: String,
    pub entity_type: EntityType,
    pub current_value: f64,
    pub previous_value: Option<f64>,
    pub confidence: f64,
    pub trend: TrendDirection,
    pub rolling_average: f64,
    pub evaluation_window_days: u32,
    pub trend_history: Vec<TrendPoint>,
    pub updated_at: DateTime<Utc>,
}

impl SystemStateEntity {
    pub fn new(entity_name: impl Into<String>, entity_type: EntityType, value: f64) -> Self {
        Self {
            entity_name: entity_name.into(),
            entity_type,
            current_value: value,
            previous_value: None,
            confidence: 0.5,
            trend: TrendDirection::Stable,
            rolling_average: value,
            evaluation_window_days: 7,
            trend_history: vec![TrendPoint {
                value,
                recorded_at: Utc::now(),
            }],
            updated_at: Utc::now(),
        }
    }

    /// current - previous; zero when no previous observation exists.
    pub fn delta(&self) -> f64 {
        self.previous_value
            .map(|p| self.current_value - p)
            .unwrap_or(0.0)
    }

    /// Fold in a new observation: shift current to previous, recompute trend
    /// direction, rolling average and the bounded history.
    pub fn observe(&mut self, value: f64) {
        self.previous_value = Some(self.current_value);
        self.current_value = value;
        let delta = self.delta();
        self.trend = if delta > f64::EPSILON {
            TrendDirection::Improving
        } else if delta < -f64::EPSILON {
            TrendDirection::Degrading
        } else {
            TrendDirection::Stable
        };
        self.trend_history.push(TrendPoint {
            value,
            recorded_at: Utc::now(),
        });
        if self.trend_history.len() > TREND_HISTORY_CAP {
            let excess = self.trend_history.len() - TREND_HISTORY_CAP;
            self.trend_history.drain(0..excess);
        }
        self.rolling_average =
            self.trend_history.iter().map(|p| p.value).sum::<f64>() / self.trend_history.len() as f64;
        self.updated_at = Utc::now();
    }
}

/// Store-facing service for recording observations.
pub struct SystemStateService;

impl SystemStateService {
    /// Record a measurement for `entity_name`, creating the entity on first
    /// sight. Returns the updated snapshot.
    pub fn record(
        uow: &UnitOfWork<'_>,
        entity_name: &str,
        entity_type: EntityType,
        value: f64,
    ) -> Result<SystemStateEntity> {
        let mut entity = match uow.get_system_entity(entity_name)? {
            Some(existing) => existing,
            None => {
                let fresh = SystemStateEntity::new(entity_name, entity_type, value);
                uow.upsert_system_entity(&fresh)?;
                debug!("system_state: created entity '{entity_name}' = {value}");
                return Ok(fresh);
            }
        };
        entity.observe(value);
        uow.upsert_system_entity(&entity)?;
        debug!(
            "system_state: '{entity_name}' {} -> {value} (trend {})",
            entity.previous_value.unwrap_or(value),
            entity.trend.as_str()
        );
        Ok(entity)
    }

    pub fn set_confidence(
        uow: &UnitOfWork<'_>,
        entity_name: &str,
        confidence: f64,
    ) -> Result<SystemStateEntity> {
        let mut entity = uow
            .get_system_entity(entity_name)?
            .ok_or_else(|| TelosError::NotFound(format!("system entity {entity_name}")))?;
        entity.confidence = confidence.clamp(0.0, 1.0);
        entity.updated_at = Utc::now();
        uow.upsert_system_entity(&entity)?;
        Ok(entity)
    }
}
