//! Call quality telemetry
//!
//! Turns periodic RTCP-style measurements into a Mean Opinion Score using a
//! simplified E-model, and keeps running aggregates of the scores per call.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Number of samples in the rolling window
pub const ROLLING_WINDOW: usize = 10;

/// One RTCP-like measurement reported by the media provider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RtpMeasurement {
    /// Round trip time in seconds
    pub round_trip_time: f64,
    /// Interarrival jitter in seconds
    pub jitter: f64,
    /// Fraction of packets lost since the last report, `0.0..=1.0`
    pub fraction_lost: f64,
}

/// Estimate a Mean Opinion Score from network metrics
///
/// Effective latency is `1000·(rtt + 2·jitter) + 10` ms. The R value starts
/// at 93.2 and loses `latency/40` below 160 ms, `(latency-120)/10` above.
/// Every percent of loss costs 2.5 points, and R never goes below 0.
/// Result is clamped to `[1.0, 5.0]`.
///
/// ```rust
/// use webcall_core::stats::calculate_mos;
///
/// let perfect = calculate_mos(0.0, 0.0, 0.0);
/// assert!(perfect > 4.3);
///
/// let lossy = calculate_mos(0.05, 0.01, 0.2);
/// assert!(lossy < perfect);
/// assert!(lossy >= 1.0);
/// ```
pub fn calculate_mos(round_trip_time: f64, jitter: f64, fraction_lost: f64) -> f64 {
    let rtt = sanitize(round_trip_time);
    let jitter = sanitize(jitter);
    let lost = sanitize(fraction_lost).min(1.0);

    let effective_latency = 1000.0 * (rtt + 2.0 * jitter) + 10.0;

    let mut r = if effective_latency < 160.0 {
        93.2 - effective_latency / 40.0
    } else {
        93.2 - (effective_latency - 120.0) / 10.0
    };

    r -= 2.5 * (lost * 100.0);
    let r = r.max(0.0);

    let mos = 1.0 + 0.035 * r + 0.000007 * r * (r - 60.0) * (100.0 - r);
    mos.clamp(1.0, 5.0)
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 { value } else { 0.0 }
}

/// Running aggregate over one metric stream, O(1) per sample
#[derive(Debug, Clone, Default)]
pub struct StatsAggregation {
    count: u64,
    sum: f64,
    lowest: Option<f64>,
    highest: Option<f64>,
    last: Option<f64>,
    window: VecDeque<f64>,
    window_sum: f64,
}

impl StatsAggregation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sample: f64) {
        self.count += 1;
        self.sum += sample;
        self.lowest = Some(self.lowest.map_or(sample, |v| v.min(sample)));
        self.highest = Some(self.highest.map_or(sample, |v| v.max(sample)));
        self.last = Some(sample);

        self.window.push_back(sample);
        self.window_sum += sample;
        if self.window.len() > ROLLING_WINDOW {
            if let Some(evicted) = self.window.pop_front() {
                self.window_sum -= evicted;
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn lowest(&self) -> Option<f64> {
        self.lowest
    }

    pub fn highest(&self) -> Option<f64> {
        self.highest
    }

    pub fn last(&self) -> Option<f64> {
        self.last
    }

    /// Average of the last [`ROLLING_WINDOW`] samples
    pub fn rolling_average(&self) -> Option<f64> {
        (!self.window.is_empty()).then(|| self.window_sum / self.window.len() as f64)
    }

    pub fn snapshot(&self) -> AggregationSnapshot {
        AggregationSnapshot {
            count: self.count,
            average: self.average(),
            lowest: self.lowest,
            highest: self.highest,
            last: self.last,
            rolling_average: self.rolling_average(),
        }
    }
}

/// Plain copy of a [`StatsAggregation`] for events
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregationSnapshot {
    pub count: u64,
    pub average: Option<f64>,
    pub lowest: Option<f64>,
    pub highest: Option<f64>,
    pub last: Option<f64>,
    pub rolling_average: Option<f64>,
}

/// Per-session quality statistics
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub mos: StatsAggregation,
    pub last_measurement: Option<RtpMeasurement>,
}

impl SessionStats {
    /// Fold in one measurement and return the MOS computed from it
    pub fn record(&mut self, measurement: RtpMeasurement) -> f64 {
        let mos = calculate_mos(
            measurement.round_trip_time,
            measurement.jitter,
            measurement.fraction_lost,
        );
        self.mos.add(mos);
        self.last_measurement = Some(measurement);
        mos
    }

    pub fn snapshot(&self) -> QualitySnapshot {
        QualitySnapshot {
            mos: self.mos.snapshot(),
            last_measurement: self.last_measurement,
        }
    }
}

/// Quality report carried by `callQualityUpdate` events
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QualitySnapshot {
    pub mos: AggregationSnapshot,
    pub last_measurement: Option<RtpMeasurement>,
}
