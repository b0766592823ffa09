//! Linear-trend power forecasting over a bucketed history window.

use crate::bucket::{Bucket, BucketWidth, MAX_BUCKETS_PER_QUERY};
use crate::error::EngineError;
use crate::telemetry::Scope;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

/// Two-sided 95% z-score for a normal residual distribution.
pub const CONFIDENCE_Z: f64 = 1.96;

/// Longest history window or horizon a request may ask for: ten years.
pub const MAX_FORECAST_MINUTES: i64 = 10 * 366 * 24 * 60;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastModel {
    #[serde(rename = "deviceId")]
    pub scope: Scope,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub rolling_mean_kw: f64,
    pub trend_slope_per_minute: f64,
    pub trend_intercept: f64,
    pub residual_std_dev_kw: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastPoint {
    pub time: DateTime<Utc>,
    pub predicted_power_kw: f64,
    pub lower_bound_kw: f64,
    pub upper_bound_kw: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Forecast {
    #[serde(flatten)]
    pub model: ForecastModel,
    pub forecast_start: DateTime<Utc>,
    pub horizon_minutes: i64,
    pub points: Vec<ForecastPoint>,
}

/// Parameters of a forecast request after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastRequest {
    pub scope: Scope,
    pub window_minutes: i64,
    pub horizon_minutes: i64,
    pub width: BucketWidth,
}

impl ForecastRequest {
    pub fn new(
        scope: Scope,
        window_minutes: i64,
        horizon_minutes: i64,
        width: BucketWidth,
    ) -> Result<Self, EngineError> {
        if horizon_minutes <= 0 {
            return Err(EngineError::validation("horizonMinutes must be positive"));
        }
        if window_minutes <= 0 {
            return Err(EngineError::validation("windowMinutes must be positive"));
        }
        if horizon_minutes > MAX_FORECAST_MINUTES {
            return Err(EngineError::validation(format!(
                "horizonMinutes must not exceed {MAX_FORECAST_MINUTES}"
            )));
        }
        if window_minutes > MAX_FORECAST_MINUTES {
            return Err(EngineError::validation(format!(
                "windowMinutes must not exceed {MAX_FORECAST_MINUTES}"
            )));
        }
        let request = Self {
            scope,
            window_minutes,
            horizon_minutes,
            width,
        };
        let points = request.point_count();
        if points > MAX_BUCKETS_PER_QUERY {
            return Err(EngineError::validation(format!(
                "horizon spans {points} points of {width}; at most {MAX_BUCKETS_PER_QUERY} are allowed"
            )));
        }
        Ok(request)
    }

    /// Window length actually fitted, never shorter than `min_window_minutes`.
    pub fn effective_window_minutes(&self, min_window_minutes: i64) -> i64 {
        self.window_minutes
            .max(min_window_minutes)
            .min(MAX_FORECAST_MINUTES)
    }

    pub fn point_count(&self) -> i64 {
        let horizon_secs = self.horizon_minutes.saturating_mul(60);
        let width = self.width.seconds();
        let whole = horizon_secs / width;
        let partial = i64::from(horizon_secs % width != 0);
        whole.saturating_add(partial).max(1)
    }
}

fn window_span(window_minutes: i64) -> ChronoDuration {
    ChronoDuration::try_minutes(window_minutes.clamp(0, MAX_FORECAST_MINUTES))
        .unwrap_or_else(ChronoDuration::zero)
}

/// End of the bucket holding `ts`, saturating at the last representable instant.
fn bucket_end(width: BucketWidth, ts: DateTime<Utc>) -> DateTime<Utc> {
    width
        .next_boundary(width.align_down(ts))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Chooses the `[start, end)` span to fit given the scope's earliest and
/// latest record timestamps.
///
/// The window closes at the end of the bucket holding `latest` and reaches
/// back `window_minutes`, but never before the bucket holding `earliest`.
pub fn plan_window(
    earliest: DateTime<Utc>,
    latest: DateTime<Utc>,
    window_minutes: i64,
    width: BucketWidth,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let end = bucket_end(width, latest);
    let first = width.align_down(earliest);
    let start = end
        .checked_sub_signed(window_span(window_minutes))
        .map(|nominal| width.align_down(nominal).max(first))
        .unwrap_or(first);
    (start, end)
}

/// Fits the trend model to a contiguous bucket series covering
/// `[window_start, window_end)`. Empty buckets count as zero output.
pub fn fit_model(
    scope: Scope,
    buckets: &[Bucket],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> ForecastModel {
    let samples: Vec<(f64, f64)> = buckets
        .iter()
        .map(|bucket| {
            (
                elapsed_minutes(window_start, bucket.bucket_start),
                bucket.average_power_kw,
            )
        })
        .collect();

    let rolling_mean_kw = if samples.is_empty() {
        0.0
    } else {
        samples.iter().map(|(_, y)| y).sum::<f64>() / samples.len() as f64
    };

    let non_empty: Vec<&Bucket> = buckets.iter().filter(|b| !b.is_empty()).collect();
    let (slope, intercept, residual) = if non_empty.len() < 2 {
        let intercept = non_empty.first().map(|b| b.average_power_kw).unwrap_or(0.0);
        (0.0, intercept, 0.0)
    } else {
        let (slope, intercept) = least_squares(&samples);
        (slope, intercept, residual_std_dev(&samples, slope, intercept))
    };

    ForecastModel {
        scope,
        window_start,
        window_end,
        rolling_mean_kw,
        trend_slope_per_minute: slope,
        trend_intercept: intercept,
        residual_std_dev_kw: residual,
    }
}

/// Projects `model` forward from `forecast_start`, one point per bucket.
pub fn project(
    model: &ForecastModel,
    forecast_start: DateTime<Utc>,
    point_count: i64,
    width: BucketWidth,
) -> Vec<ForecastPoint> {
    let band = CONFIDENCE_Z * model.residual_std_dev_kw;
    let step_span = width.duration();
    let mut next = Some(forecast_start);
    (0..point_count.max(0))
        .map_while(|_| {
            let time = next?;
            next = time.checked_add_signed(step_span);
            Some(time)
        })
        .map(|time| {
            let x = elapsed_minutes(model.window_start, time);
            let raw = model.trend_intercept + model.trend_slope_per_minute * x;
            let predicted = if raw.is_finite() { raw.max(0.0) } else { 0.0 };
            ForecastPoint {
                time,
                predicted_power_kw: predicted,
                lower_bound_kw: (predicted - band).max(0.0),
                upper_bound_kw: predicted + band,
            }
        })
        .collect()
}

/// Fits and projects in one step for an already bucketed window.
pub fn forecast_from_buckets(
    request: &ForecastRequest,
    buckets: &[Bucket],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Forecast {
    let model = fit_model(request.scope.clone(), buckets, window_start, window_end);
    let points = project(&model, window_end, request.point_count(), request.width);
    Forecast {
        model,
        forecast_start: window_end,
        horizon_minutes: request.horizon_minutes,
        points,
    }
}

/// Forecast for a scope without any history: all points are zero.
pub fn empty_forecast(
    request: &ForecastRequest,
    now: DateTime<Utc>,
    window_minutes: i64,
) -> Forecast {
    let window_end = bucket_end(request.width, now);
    let window_start = window_end
        .checked_sub_signed(window_span(window_minutes))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    forecast_from_buckets(request, &[], window_start, window_end)
}

fn elapsed_minutes(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 60_000.0
}

fn least_squares(samples: &[(f64, f64)]) -> (f64, f64) {
    let n = samples.len() as f64;
    let mean_x = samples.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = samples.iter().map(|(_, y)| y).sum::<f64>() / n;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (x, y) in samples {
        let dx = x - mean_x;
        sxx += dx * dx;
        sxy += dx * (y - mean_y);
    }
    if sxx.abs() < f64::EPSILON {
        return (0.0, mean_y);
    }
    let slope = sxy / sxx;
    (slope, mean_y - slope * mean_x)
}

fn residual_std_dev(samples: &[(f64, f64)], slope: f64, intercept: f64) -> f64 {
    if samples.len() <= 2 {
        return 0.0;
    }
    let ss_res: f64 = samples
        .iter()
        .map(|(x, y)| {
            let residual = y - (intercept + slope * x);
            residual * residual
        })
        .sum();
    (ss_res / (samples.len() - 2) as f64).sqrt()
}
