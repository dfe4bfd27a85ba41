//! A single registered service instance and its live counters.

use crate::config::InstanceConfig;
use crate::util::unix_millis;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Smoothing factor applied to each new response time sample.
const RESPONSE_TIME_ALPHA: f64 = 0.2;

/// Service instance owned by a [`LoadBalancer`](crate::balancer::LoadBalancer).
///
/// Identity fields are fixed at registration. Health, the connection count,
/// and the smoothed response time are updated concurrently through `&self`.
#[derive(Debug)]
pub struct ServiceInstance {
    id: String,
    host: String,
    port: u16,
    weight: u32,
    max_connections: u32,
    metadata: HashMap<String, String>,
    healthy: AtomicBool,
    active_connections: AtomicU32,
    /// Smoothed response time in milliseconds, 0 until first measured.
    response_time_ms: Mutex<f64>,
    /// Unix time of the last probe in milliseconds, 0 if never probed.
    last_health_check: AtomicU64,
}

/// Point-in-time view of an instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceStats {
    pub id: String,
    pub address: String,
    pub weight: u32,
    pub healthy: bool,
    pub active_connections: u32,
    pub max_connections: u32,
    pub response_time_ms: f64,
    pub last_health_check_ms: Option<u64>,
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    /// Create a healthy instance with zeroed counters.
    pub fn new(config: &InstanceConfig) -> Self {
        Self {
            id: config.id.clone(),
            host: config.host.clone(),
            port: config.port,
            weight: config.weight,
            max_connections: config.max_connections,
            metadata: config.metadata.clone(),
            healthy: AtomicBool::new(true),
            active_connections: AtomicU32::new(0),
            response_time_ms: Mutex::new(0.0),
            last_health_check: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Set the health flag, returning the previous value.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    /// Stamp the time of a completed probe.
    pub fn mark_checked(&self) {
        self.last_health_check.store(unix_millis(), Ordering::Release);
    }

    /// Unix time of the last probe in milliseconds.
    pub fn last_health_check(&self) -> Option<u64> {
        match self.last_health_check.load(Ordering::Acquire) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Healthy and below its connection limit.
    pub fn is_available(&self) -> bool {
        self.is_healthy() && self.active_connections() < self.max_connections
    }

    /// Claim a connection slot if one is free.
    pub fn try_acquire(&self) -> bool {
        let max = self.max_connections;
        self.active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max).then_some(current + 1)
            })
            .is_ok()
    }

    /// Give back a connection slot. Never drops below zero.
    pub fn release(&self) -> u32 {
        let previous = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn response_time_ms(&self) -> f64 {
        *self.response_time_ms.lock()
    }

    /// Fold a response time sample into the moving average.
    ///
    /// The first sample is taken as is.
    pub fn record_response_time(&self, elapsed: Duration) -> f64 {
        let sample = elapsed.as_secs_f64() * 1000.0;
        let mut current = self.response_time_ms.lock();
        *current = if *current == 0.0 {
            sample
        } else {
            *current * (1.0 - RESPONSE_TIME_ALPHA) + sample * RESPONSE_TIME_ALPHA
        };
        *current
    }

    /// True when `config` describes this instance unchanged.
    pub fn matches(&self, config: &InstanceConfig) -> bool {
        self.id == config.id
            && self.host == config.host
            && self.port == config.port
            && self.weight == config.weight
            && self.max_connections == config.max_connections
            && self.metadata == config.metadata
    }

    pub fn snapshot(&self) -> InstanceStats {
        InstanceStats {
            id: self.id.clone(),
            address: self.address(),
            weight: self.weight,
            healthy: self.is_healthy(),
            active_connections: self.active_connections(),
            max_connections: self.max_connections,
            response_time_ms: self.response_time_ms(),
            last_health_check_ms: self.last_health_check(),
            metadata: self.metadata.clone(),
        }
    }
}
