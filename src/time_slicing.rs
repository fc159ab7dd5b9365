//! Time slicing of event data.
//!
//! A [TimeSlicingPlan] turns a user supplied slicing specification into concrete
//! `[start, stop)` windows, relative to the start of a run:
//!
//! * `Uniform`: slices of a fixed duration. The number of slices depends on the run duration.
//! * `UniformEven`: a fixed number of equal-width slices covering the whole run.
//! * `Custom`: a comma separated list of boundary times.
//! * `LogValue`: custom boundaries plus the name of a sample log used to filter the events.
//!
//! Uniform modes can only be resolved once the run duration is known; custom modes are resolved
//! when the plan is created.

use crate::error::ReductionError;
use crate::models::parse_key_value_string;

use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Largest number of slices a plan may produce.
pub const MAX_SLICES: usize = 10_000;

/// Slicing mode
#[derive(Clone, Copy, Debug, Deserialize, Display, PartialEq, Eq, Serialize)]
pub enum SlicingType {
    Uniform,
    UniformEven,
    Custom,
    LogValue,
}

/// A `[start, stop)` time window in seconds relative to the start of the run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TimeWindow {
    pub start: f64,
    pub stop: f64,
}

impl TimeWindow {
    pub fn new(start: f64, stop: f64) -> Self {
        TimeWindow { start, stop }
    }

    pub fn duration(&self) -> f64 {
        self.stop - self.start
    }
}

/// Parsed slicing specification and, once resolved, its time windows.
#[derive(Clone, Debug, PartialEq)]
pub struct TimeSlicingPlan {
    slicing_type: SlicingType,
    values: String,
    log_filter: Option<String>,
    /// Slice duration (Uniform) or slice count (UniformEven)
    uniform: Option<f64>,
    /// Run duration the windows were resolved against, for uniform modes
    resolved_for: Option<f64>,
    windows: Option<Vec<TimeWindow>>,
}

impl TimeSlicingPlan {
    /// Parse a slicing specification.
    ///
    /// Returns a validation error if `values` is malformed for the slicing type. An empty
    /// `values` string yields a disabled plan.
    pub fn new(slicing_type: SlicingType, values: &str) -> Result<Self, ReductionError> {
        let values = values.trim();
        let mut plan = TimeSlicingPlan {
            slicing_type,
            values: values.to_string(),
            log_filter: None,
            uniform: None,
            resolved_for: None,
            windows: None,
        };
        if values.is_empty() {
            return Ok(plan);
        }
        match slicing_type {
            SlicingType::Uniform => {
                let duration = parse_time(values)?;
                if duration <= 0.0 {
                    return Err(ReductionError::validation(format!(
                        "slice duration must be positive, got {}",
                        values
                    )));
                }
                plan.uniform = Some(duration);
            }
            SlicingType::UniformEven => {
                let count: usize = values.parse().map_err(|_| {
                    ReductionError::validation(format!(
                        "number of slices must be a positive integer, got {}",
                        values
                    ))
                })?;
                if count == 0 {
                    return Err(ReductionError::validation(
                        "number of slices must be a positive integer, got 0",
                    ));
                }
                if count > MAX_SLICES {
                    return Err(too_many_slices(count as f64));
                }
                plan.uniform = Some(count as f64);
            }
            SlicingType::Custom => {
                plan.windows = Some(parse_custom(values)?);
            }
            SlicingType::LogValue => {
                let (slicing, log_filter) = parse_log_value(values)?;
                plan.windows = Some(parse_custom(&slicing)?);
                plan.log_filter = Some(log_filter);
            }
        }
        Ok(plan)
    }

    pub fn slicing_type(&self) -> SlicingType {
        self.slicing_type
    }

    pub fn values(&self) -> &str {
        &self.values
    }

    /// Slicing is enabled whenever a specification was given.
    pub fn is_enabled(&self) -> bool {
        !self.values.is_empty()
    }

    /// Name of the log used to filter events, for `LogValue` slicing.
    pub fn log_filter(&self) -> Option<&str> {
        self.log_filter.as_deref()
    }

    pub fn is_resolved(&self) -> bool {
        self.windows.is_some()
    }

    /// Resolve the plan against a run of the given total duration in seconds.
    ///
    /// Resolution is idempotent. Custom modes ignore the run duration.
    pub fn resolve(&mut self, run_duration: f64) -> Result<&[TimeWindow], ReductionError> {
        match self.slicing_type {
            SlicingType::Uniform | SlicingType::UniformEven if self.is_enabled() => {
                if !run_duration.is_finite() || run_duration <= 0.0 {
                    return Err(ReductionError::validation(format!(
                        "cannot slice a run of duration {}",
                        run_duration
                    )));
                }
                if self.resolved_for != Some(run_duration) {
                    let uniform = self.uniform.ok_or(ReductionError::NotResolved)?;
                    let windows = if self.slicing_type == SlicingType::Uniform {
                        uniform_windows(uniform, run_duration)?
                    } else {
                        uniform_even_windows(uniform as usize, run_duration)
                    };
                    self.windows = Some(windows);
                    self.resolved_for = Some(run_duration);
                }
            }
            _ => {
                if self.windows.is_none() {
                    self.windows = Some(Vec::new());
                }
            }
        }
        Ok(self.windows.as_deref().unwrap_or_default())
    }

    /// Number of slices.
    ///
    /// Fails with [ReductionError::NotResolved] for uniform modes that have not been resolved.
    pub fn number_of_slices(&self) -> Result<usize, ReductionError> {
        if !self.is_enabled() {
            return Ok(0);
        }
        self.windows
            .as_ref()
            .map(Vec::len)
            .ok_or(ReductionError::NotResolved)
    }

    /// Time window of the slice at `index`.
    pub fn window(&self, index: usize) -> Result<TimeWindow, ReductionError> {
        let windows = self.windows.as_ref().ok_or(ReductionError::NotResolved)?;
        windows
            .get(index)
            .copied()
            .ok_or(ReductionError::InvalidIndex {
                index,
                count: windows.len(),
            })
    }

    pub fn windows(&self) -> Result<&[TimeWindow], ReductionError> {
        self.windows.as_deref().ok_or(ReductionError::NotResolved)
    }
}

fn parse_time(value: &str) -> Result<f64, ReductionError> {
    let value = value.trim();
    let time: f64 = value
        .parse()
        .map_err(|_| ReductionError::validation(format!("invalid time value '{}'", value)))?;
    if !time.is_finite() {
        return Err(ReductionError::validation(format!(
            "invalid time value '{}'",
            value
        )));
    }
    Ok(time)
}

fn too_many_slices(count: f64) -> ReductionError {
    ReductionError::validation(format!(
        "too many slices: {} requested, at most {} allowed",
        count, MAX_SLICES
    ))
}

/// Slices of `duration` seconds; the last one may extend past the end of the run.
fn uniform_windows(duration: f64, run_duration: f64) -> Result<Vec<TimeWindow>, ReductionError> {
    let count = (run_duration / duration).ceil();
    if !count.is_finite() || count > MAX_SLICES as f64 {
        return Err(too_many_slices(count));
    }
    let count = count as usize;
    Ok((0..count)
        .map(|i| TimeWindow::new(i as f64 * duration, (i + 1) as f64 * duration))
        .collect())
}

fn uniform_even_windows(count: usize, run_duration: f64) -> Vec<TimeWindow> {
    let width = run_duration / count as f64;
    (0..count)
        .map(|i| {
            let stop = if i + 1 == count {
                run_duration
            } else {
                (i + 1) as f64 * width
            };
            TimeWindow::new(i as f64 * width, stop)
        })
        .collect()
}

/// Parse a list of boundary times into windows.
fn parse_custom(values: &str) -> Result<Vec<TimeWindow>, ReductionError> {
    let times = values
        .split(',')
        .filter(|value| !value.trim().is_empty())
        .map(parse_time)
        .collect::<Result<Vec<f64>, ReductionError>>()?;
    if times.is_empty() {
        return Err(ReductionError::validation("no slicing values given"));
    }
    if let Some(negative) = times.iter().find(|time| **time < 0.0) {
        return Err(ReductionError::validation(format!(
            "slicing values must not be negative, got {}",
            negative
        )));
    }
    let pairs: Vec<(f64, f64)> = if times.len() == 1 {
        vec![(0.0, times[0])]
    } else {
        times.windows(2).map(|pair| (pair[0], pair[1])).collect()
    };
    let mut windows: Vec<TimeWindow> = Vec::with_capacity(pairs.len());
    for (start, stop) in pairs {
        if start >= stop {
            return Err(ReductionError::validation(format!(
                "slice start {} must be less than stop {}",
                start, stop
            )));
        }
        let window = TimeWindow::new(start, stop);
        if !windows.contains(&window) {
            windows.push(window);
        }
    }
    Ok(windows)
}

/// Split a `Slicing=...,LogFilter=...` specification.
fn parse_log_value(values: &str) -> Result<(String, String), ReductionError> {
    let options = parse_key_value_string(values)?;
    match (options.get("Slicing"), options.get("LogFilter")) {
        (Some(slicing), Some(log_filter)) if !log_filter.trim().is_empty() => {
            Ok((slicing.to_string(), log_filter.trim().to_string()))
        }
        (Some(_), _) => Err(ReductionError::validation(
            "log value slicing requires a LogFilter",
        )),
        (None, Some(_)) => Err(ReductionError::validation(
            "log value slicing requires Slicing values",
        )),
        (None, None) => Err(ReductionError::validation(
            "log value slicing requires Slicing values and a LogFilter",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_windows(expected: &[(f64, f64)], actual: &[TimeWindow]) {
        assert_eq!(expected.len(), actual.len());
        for ((start, stop), window) in expected.iter().zip(actual) {
            assert!((start - window.start).abs() < 1e-3, "{:?}", window);
            assert!((stop - window.stop).abs() < 1e-3, "{:?}", window);
        }
    }

    #[test]
    fn disabled_plan() {
        let mut plan = TimeSlicingPlan::new(SlicingType::Uniform, "  ").unwrap();
        assert!(!plan.is_enabled());
        assert_eq!(0, plan.number_of_slices().unwrap());
        assert!(plan.resolve(100.0).unwrap().is_empty());
    }

    #[test]
    fn uniform() {
        let mut plan = TimeSlicingPlan::new(SlicingType::Uniform, "500").unwrap();
        assert!(plan.is_enabled());
        let windows = plan.resolve(1384.0).unwrap().to_vec();
        assert_windows(&[(0.0, 500.0), (500.0, 1000.0), (1000.0, 1500.0)], &windows);
        assert_eq!(3, plan.number_of_slices().unwrap());
    }

    #[test]
    fn uniform_count_depends_on_run() {
        let mut plan = TimeSlicingPlan::new(SlicingType::Uniform, "100").unwrap();
        assert_eq!(4, plan.resolve(400.0).unwrap().len());
        assert_eq!(5, plan.resolve(401.0).unwrap().len());
    }

    #[test]
    fn uniform_even() {
        let mut plan = TimeSlicingPlan::new(SlicingType::UniformEven, "3").unwrap();
        let windows = plan.resolve(1384.0).unwrap().to_vec();
        assert_windows(
            &[(0.0, 461.333), (461.333, 922.667), (922.667, 1384.0)],
            &windows,
        );
        assert_eq!(1384.0, windows[2].stop);
        assert_eq!(3, plan.number_of_slices().unwrap());
        assert_eq!(3, plan.resolve(10.0).unwrap().len());
    }

    #[test]
    fn resolve_is_idempotent() {
        let mut plan = TimeSlicingPlan::new(SlicingType::UniformEven, "4").unwrap();
        let first = plan.resolve(1000.0).unwrap().to_vec();
        let second = plan.resolve(1000.0).unwrap().to_vec();
        assert_eq!(first, second);
    }

    #[test]
    fn uniform_not_resolved() {
        let plan = TimeSlicingPlan::new(SlicingType::Uniform, "10").unwrap();
        assert!(matches!(
            plan.number_of_slices(),
            Err(ReductionError::NotResolved)
        ));
        let plan = TimeSlicingPlan::new(SlicingType::UniformEven, "10").unwrap();
        assert!(matches!(
            plan.number_of_slices(),
            Err(ReductionError::NotResolved)
        ));
        assert!(matches!(plan.window(0), Err(ReductionError::NotResolved)));
    }

    #[test]
    #[should_panic(expected = "slice duration must be positive")]
    fn uniform_negative() {
        TimeSlicingPlan::new(SlicingType::Uniform, "-5").unwrap();
    }

    #[test]
    #[should_panic(expected = "number of slices must be a positive integer")]
    fn uniform_even_not_integer() {
        TimeSlicingPlan::new(SlicingType::UniformEven, "2.5").unwrap();
    }

    #[test]
    #[should_panic(expected = "cannot slice a run of duration 0")]
    fn uniform_zero_duration_run() {
        let mut plan = TimeSlicingPlan::new(SlicingType::Uniform, "10").unwrap();
        plan.resolve(0.0).unwrap();
    }

    #[test]
    fn uniform_tiny_duration() {
        let mut plan = TimeSlicingPlan::new(SlicingType::Uniform, "1e-300").unwrap();
        let error = plan.resolve(1384.0).unwrap_err();
        assert_eq!(crate::error::ErrorKind::Validation, error.kind());
        assert!(error.to_string().starts_with("too many slices"), "{}", error);
        assert!(!plan.is_resolved());

        let mut plan = TimeSlicingPlan::new(SlicingType::Uniform, "1e-9").unwrap();
        assert!(plan.resolve(1384.0).is_err());
    }

    #[test]
    fn uniform_at_slice_limit() {
        let mut plan = TimeSlicingPlan::new(SlicingType::Uniform, "1").unwrap();
        assert_eq!(MAX_SLICES, plan.resolve(MAX_SLICES as f64).unwrap().len());
        assert!(plan.resolve(MAX_SLICES as f64 + 0.5).is_err());
    }

    #[test]
    #[should_panic(expected = "too many slices")]
    fn uniform_even_huge_count() {
        TimeSlicingPlan::new(SlicingType::UniformEven, "1000000000000").unwrap();
    }

    #[test]
    fn uniform_even_at_slice_limit() {
        let mut plan =
            TimeSlicingPlan::new(SlicingType::UniformEven, &MAX_SLICES.to_string()).unwrap();
        assert_eq!(MAX_SLICES, plan.resolve(1.0).unwrap().len());
    }

    #[test]
    fn non_finite_run_duration() {
        for duration in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
            let mut plan = TimeSlicingPlan::new(SlicingType::Uniform, "10").unwrap();
            assert!(plan.resolve(duration).is_err());
            let mut plan = TimeSlicingPlan::new(SlicingType::UniformEven, "3").unwrap();
            assert!(plan.resolve(duration).is_err());
        }
    }

    #[test]
    fn custom() {
        let mut plan = TimeSlicingPlan::new(SlicingType::Custom, "0,10,20,30").unwrap();
        assert_eq!(3, plan.number_of_slices().unwrap());
        assert_windows(
            &[(0.0, 10.0), (10.0, 20.0), (20.0, 30.0)],
            plan.resolve(5.0).unwrap(),
        );
    }

    #[test]
    fn custom_single_value() {
        let plan = TimeSlicingPlan::new(SlicingType::Custom, "15.5").unwrap();
        assert_eq!(TimeWindow::new(0.0, 15.5), plan.window(0).unwrap());
        assert_eq!(1, plan.number_of_slices().unwrap());
    }

    #[test]
    #[should_panic(expected = "slice start 20 must be less than stop 10")]
    fn custom_descending() {
        TimeSlicingPlan::new(SlicingType::Custom, "0,20,10").unwrap();
    }

    #[test]
    #[should_panic(expected = "slice start 10 must be less than stop 10")]
    fn custom_repeated_boundary() {
        TimeSlicingPlan::new(SlicingType::Custom, "0,10,10").unwrap();
    }

    #[test]
    #[should_panic(expected = "slicing values must not be negative")]
    fn custom_negative() {
        TimeSlicingPlan::new(SlicingType::Custom, "-1,10").unwrap();
    }

    #[test]
    #[should_panic(expected = "invalid time value 'abc'")]
    fn custom_not_a_number() {
        TimeSlicingPlan::new(SlicingType::Custom, "0,abc").unwrap();
    }

    #[test]
    #[should_panic(expected = "no slicing values given")]
    fn custom_empty_list() {
        TimeSlicingPlan::new(SlicingType::Custom, ",,").unwrap();
    }

    #[test]
    fn custom_window_out_of_range() {
        let plan = TimeSlicingPlan::new(SlicingType::Custom, "0,10").unwrap();
        assert!(matches!(
            plan.window(1),
            Err(ReductionError::InvalidIndex { index: 1, count: 1 })
        ));
    }

    #[test]
    fn log_value() {
        let mut plan = TimeSlicingPlan::new(
            SlicingType::LogValue,
            "Slicing=\"0,10,20,30\",LogFilter=proton_charge",
        )
        .unwrap();
        let custom = TimeSlicingPlan::new(SlicingType::Custom, "0,10,20,30").unwrap();
        assert_eq!(Some("proton_charge"), plan.log_filter());
        assert_eq!(custom.windows().unwrap(), plan.resolve(1.0).unwrap());
    }

    #[test]
    #[should_panic(expected = "log value slicing requires a LogFilter")]
    fn log_value_without_filter() {
        TimeSlicingPlan::new(SlicingType::LogValue, "Slicing=\"0,10\"").unwrap();
    }

    #[test]
    #[should_panic(expected = "log value slicing requires Slicing values")]
    fn log_value_without_slicing() {
        TimeSlicingPlan::new(SlicingType::LogValue, "LogFilter=proton_charge").unwrap();
    }

    #[test]
    fn log_value_errors_are_validation_errors() {
        let error = TimeSlicingPlan::new(SlicingType::LogValue, "LogFilter=x").unwrap_err();
        assert_eq!(crate::error::ErrorKind::Validation, error.kind());
    }
}
