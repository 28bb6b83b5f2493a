//! Core galvanostatic charge-discharge (GCD) analysis library implemented in Rust.
//!
//! Instrument exports are loaded into a [`DataSet`] (a named store of
//! equal-length `f64` series with an optional absolute start time), segmented
//! into typed regions by the detectors in [`regions`], assembled into
//! charge-discharge cycles by [`cycles`], and reduced to per-cycle quantities
//! (efficiencies, resistance, capacitance) by [`metrics`].

use ndarray::Array1;
use thiserror::Error;

pub mod cycles;
pub mod data;
pub mod eclab;
pub mod metrics;
pub mod regions;

pub use cycles::{assemble_cycles, AssemblySummary, Cycle, CycleAssembly};
pub use data::{sync_times, Bounds, DataSet, TimeBound};
pub use eclab::{cycle_slice, cycles_slice, read_co2_txt, read_eclab, read_eclab_csv, read_eclab_txt};
pub use metrics::{
    coulombic_efficiency, cycle_time, discharge_capacitance, energy_efficiency, ohmic_resistance,
    AnalysisConfig, CapacitanceConfig, CycleMetrics, DvdtMethod, GcdAnalysis, MassNormalization,
    MetricsReport,
};
pub use regions::{
    detect_current_regions, detect_half_cycles, detect_voltage_holds, CurrentRegion,
    DetectorConfig, Direction, HalfCycleRegion, Polarity, Region, VoltageHoldRegion,
};

#[derive(Error, Debug)]
pub enum GcdError {
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to parse ECLab file: {0}")]
    EcLabParse(String),
    #[error("failed to parse CO2 file: {0}")]
    Co2Parse(String),
    #[error("unknown field or alias: {0}")]
    UnknownField(String),
    #[error("field '{name}' has {got} samples, expected {expected}")]
    FieldLengthMismatch {
        name: String,
        got: usize,
        expected: usize,
    },
    #[error("operands do not share the same field names")]
    FieldSetMismatch,
    #[error("no time field configured")]
    NoTimeData,
    #[error("start time is not set")]
    NoStartTime,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("non-zero active mass required")]
    MissingMass,
    #[error("insufficient data for analysis")]
    InsufficientData,
}

/// Trapezoidal-rule cumulative integral of `y` against `x`, first sample 0.
pub fn cumulative_trapezoid(y: &Array1<f64>, x: &Array1<f64>) -> Array1<f64> {
    let n = y.len().min(x.len());
    let mut out = Vec::with_capacity(n);
    if n > 0 {
        out.push(0.0);
    }
    let mut total = 0.0;
    for i in 1..n {
        total += 0.5 * (y[i] + y[i - 1]) * (x[i] - x[i - 1]);
        out.push(total);
    }
    Array1::from_vec(out)
}

/// Numerical derivative dy/dx: central differences in the interior, one-sided
/// at the ends. Fewer than two samples yields zeros.
pub fn gradient(y: &[f64], x: &[f64]) -> Array1<f64> {
    let n = y.len().min(x.len());
    let mut out = vec![0.0; n];
    if n >= 2 {
        out[0] = (y[1] - y[0]) / (x[1] - x[0]);
        out[n - 1] = (y[n - 1] - y[n - 2]) / (x[n - 1] - x[n - 2]);
        for i in 1..n - 1 {
            out[i] = (y[i + 1] - y[i - 1]) / (x[i + 1] - x[i - 1]);
        }
    }
    Array1::from_vec(out)
}

/// Least-squares slope of `y` against `x`. Degenerate inputs (fewer than two
/// samples, or zero variance in `x`) return 0.
pub fn linreg_slope(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n < 2 {
        return 0.0;
    }
    let nf = n as f64;
    let mean_x = x.iter().take(n).sum::<f64>() / nf;
    let mean_y = y.iter().take(n).sum::<f64>() / nf;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for k in 0..n {
        let dx = x[k] - mean_x;
        sxx += dx * dx;
        sxy += dx * (y[k] - mean_y);
    }
    if sxx == 0.0 {
        0.0
    } else {
        sxy / sxx
    }
}

/// Trailing window mean over `xs`, valid mode: output length `n - w + 1`.
pub(crate) fn rolling_mean(xs: &[f64], window: usize) -> Vec<f64> {
    let n = xs.len();
    if window == 0 || window > n {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(n - window + 1);
    let mut sum: f64 = xs.iter().take(window).sum();
    out.push(sum / window as f64);
    for i in window..n {
        sum += xs[i] - xs[i - window];
        out.push(sum / window as f64);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn cumulative_trapezoid_constant_integrand() {
        let y = array![2.0, 2.0, 2.0, 2.0];
        let x = array![0.0, 1.0, 2.0, 3.0];
        let q = cumulative_trapezoid(&y, &x);
        assert_eq!(q.to_vec(), vec![0.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn gradient_of_linear_series_is_constant() {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 3.0 * v + 1.0).collect();
        for g in gradient(&y, &x).iter() {
            assert!((g - 3.0).abs() < 1e-12);
        }
    }

    #[test]
    fn linreg_slope_recovers_line() {
        let x: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| -0.5 * v + 4.0).collect();
        assert!((linreg_slope(&x, &y) + 0.5).abs() < 1e-12);
    }

    #[test]
    fn linreg_slope_degenerate_inputs() {
        assert_eq!(linreg_slope(&[1.0], &[2.0]), 0.0);
        assert_eq!(linreg_slope(&[2.0, 2.0, 2.0], &[1.0, 5.0, 9.0]), 0.0);
    }

    #[test]
    fn rolling_mean_window_longer_than_input() {
        assert!(rolling_mean(&[1.0, 2.0], 3).is_empty());
    }
}
