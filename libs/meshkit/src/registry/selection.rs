//! Instance selection strategies for endpoint resolution

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ModelError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancer {
    /// Time-bucketed: `floor(now_secs) % n`; calls within the same second agree
    #[default]
    RoundRobin,
    /// Random, proportional to the summed endpoint weights of each instance
    Weighted,
    First,
}

impl LoadBalancer {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancer::RoundRobin => "round_robin",
            LoadBalancer::Weighted => "weighted",
            LoadBalancer::First => "first",
        }
    }
}

impl fmt::Display for LoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalancer {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(LoadBalancer::RoundRobin),
            "weighted" => Ok(LoadBalancer::Weighted),
            "first" => Ok(LoadBalancer::First),
            other => Err(ModelError::UnknownLoadBalancer(other.to_string())),
        }
    }
}

pub fn round_robin_index(now_secs: u64, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    (now_secs % len as u64) as usize
}

pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Draw a point in `1..=total` and return the first bucket that reaches it.
/// A zero total selects index 0.
pub fn weighted_index<R: Rng + ?Sized>(rng: &mut R, weights: &[u64]) -> usize {
    let total: u64 = weights.iter().sum();
    if total == 0 {
        return 0;
    }

    let mut point = rng.random_range(1..=total);
    for (idx, weight) in weights.iter().enumerate() {
        if point <= *weight {
            return idx;
        }
        point -= weight;
    }
    0
}
