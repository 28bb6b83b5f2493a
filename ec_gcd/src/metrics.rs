//! Per-cycle derived quantities and the `GcdAnalysis` façade.
//!
//! `GcdAnalysis` wraps one store holding a GCD run (fields resolvable as `t`,
//! `E`, `I`) together with the detector configuration, and memoizes detection
//! results and derived integrals. Accessing a result that has not been
//! computed yet triggers computation with the configured parameters (logged at
//! debug level); results are invalidated only by building a new analysis.
//!
//! Numerical degeneracies (zero denominators) in per-cycle metrics yield NaN
//! and a warning rather than an error, so one bad cycle never aborts a batch.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::cycles::{assemble_cycles, Cycle, CycleAssembly};
use crate::data::DataSet;
use crate::regions::{
    detect_current_regions, detect_half_cycles, detect_voltage_holds, CurrentRegion,
    DetectorConfig, HalfCycleRegion, VoltageHoldRegion,
};
use crate::{cumulative_trapezoid, gradient, linreg_slope, rolling_mean, GcdError};

/// How dV/dt is estimated over the discharge section.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DvdtMethod {
    /// Gradient of the window-averaged voltage against window-averaged time.
    SmoothedGradient,
    /// Sliding-window least-squares slope of voltage against time.
    WindowRegression,
}

/// Mass normalization convention for specific capacitance. The electrode
/// variants apply the usual x2 / x4 single-electrode correction on top of the
/// whole-cell mass sum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MassNormalization {
    Off,
    WholeCell,
    Electrode2,
    Electrode4,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapacitanceConfig {
    /// Samples per smoothing/regression window.
    pub window: usize,
    pub dvdt: DvdtMethod,
    pub normalization: MassNormalization,
    /// Fraction of the discharge tail averaged for the gravimetric summary.
    pub tail_fraction: f64,
}

impl Default for CapacitanceConfig {
    fn default() -> Self {
        Self {
            window: 10,
            dvdt: DvdtMethod::SmoothedGradient,
            normalization: MassNormalization::Off,
            tail_fraction: 0.2,
        }
    }
}

/// Full parameter set for one analysis: one detector configuration per phase,
/// capacitance estimation settings, and electrode masses in grams.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub current: DetectorConfig,
    pub hold: DetectorConfig,
    pub half_cycle: DetectorConfig,
    pub capacitance: CapacitanceConfig,
    pub mass1_g: f64,
    pub mass2_g: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            current: DetectorConfig::current_default(),
            hold: DetectorConfig::hold_default(),
            half_cycle: DetectorConfig::half_cycle_default(),
            capacitance: CapacitanceConfig::default(),
            mass1_g: 0.0,
            mass2_g: 0.0,
        }
    }
}

impl AnalysisConfig {
    pub fn total_mass_g(&self) -> f64 {
        self.mass1_g + self.mass2_g
    }

    pub fn params_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    pub fn params_hash_sha256(&self) -> Result<String, GcdError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| GcdError::InvalidParameter(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }

    /// Farads-to-output scale: 1 when normalization is off, otherwise the
    /// convention factor per gram of active mass.
    fn normalization_scale(&self) -> Result<f64, GcdError> {
        let factor = match self.capacitance.normalization {
            MassNormalization::Off => return Ok(1.0),
            MassNormalization::WholeCell => 1.0,
            MassNormalization::Electrode2 => 2.0,
            MassNormalization::Electrode4 => 4.0,
        };
        let total = self.total_mass_g();
        if total <= 0.0 {
            return Err(GcdError::MissingMass);
        }
        Ok(factor / total)
    }
}

/// Midpoint of the cycle's first and last time samples, as a magnitude.
pub fn cycle_time(cycle: &Cycle, t: &Array1<f64>) -> f64 {
    let start = cycle.start_index();
    let end = cycle.end_index();
    if end >= t.len() {
        warn!("cycle indices out of range of the time series");
        return f64::NAN;
    }
    ((t[start] + t[end]) / 2.0).abs()
}

/// `|recovered / delivered| * 100` over the cumulative-charge series.
pub fn coulombic_efficiency(cycle: &Cycle, charge: &Array1<f64>) -> f64 {
    efficiency_from_series(cycle, charge, "charge")
}

/// Same split as the Coulombic efficiency, over the cumulative-energy series.
pub fn energy_efficiency(cycle: &Cycle, energy: &Array1<f64>) -> f64 {
    efficiency_from_series(cycle, energy, "energy")
}

fn efficiency_from_series(cycle: &Cycle, series: &Array1<f64>, what: &str) -> f64 {
    let start = cycle.start_index();
    let split = cycle.discharging.start;
    let end = cycle.end_index();
    if end >= series.len() || split > end || start > split {
        warn!("cycle indices out of range of the cumulative {} series", what);
        return f64::NAN;
    }
    let delivered = series[split] - series[start];
    let recovered = series[end] - series[split];
    if delivered == 0.0 {
        warn!("zero {} delivered on charge; efficiency undefined", what);
        return f64::NAN;
    }
    (recovered / delivered).abs() * 100.0
}

/// Ohmic-drop resistance from the single-sample voltage/current jump at the
/// charge -> discharge boundary. Current converted mA -> A; a zero current
/// step yields NaN with a warning.
pub fn ohmic_resistance(cycle: &Cycle, voltage: &Array1<f64>, current_ma: &Array1<f64>) -> f64 {
    let split = cycle.discharging.start;
    if split == 0 || split >= voltage.len() || split >= current_ma.len() {
        warn!("discharge boundary out of range; resistance undefined");
        return f64::NAN;
    }
    let dv = voltage[split] - voltage[split - 1];
    let di = (current_ma[split] - current_ma[split - 1]) / 1000.0;
    if di == 0.0 {
        warn!("zero current step at the charge/discharge boundary; resistance undefined");
        return f64::NAN;
    }
    (dv / di).abs()
}

/// Instantaneous capacitance `C = I / (dV/dt)` over one discharge section,
/// in farads (mA -> A scaling applied). The current is window-averaged to
/// stay aligned with the dV/dt estimate; output length is `n - window + 1`.
/// Indices where the voltage slope vanishes yield NaN.
pub fn discharge_capacitance(
    t: &[f64],
    voltage: &[f64],
    current_ma: &[f64],
    cfg: &CapacitanceConfig,
) -> Result<Array1<f64>, GcdError> {
    if cfg.window == 0 {
        return Err(GcdError::InvalidParameter(
            "capacitance window must be greater than 0".to_string(),
        ));
    }
    let n = t.len().min(voltage.len()).min(current_ma.len());
    if n < cfg.window || n < 2 {
        return Ok(Array1::from_vec(Vec::new()));
    }

    let i_avg = rolling_mean(&current_ma[..n], cfg.window);
    let dvdt: Vec<f64> = match cfg.dvdt {
        DvdtMethod::SmoothedGradient => {
            let t_avg = rolling_mean(&t[..n], cfg.window);
            let v_avg = rolling_mean(&voltage[..n], cfg.window);
            gradient(&v_avg, &t_avg).to_vec()
        }
        DvdtMethod::WindowRegression => (0..n - cfg.window + 1)
            .map(|k| linreg_slope(&t[k..k + cfg.window], &voltage[k..k + cfg.window]))
            .collect(),
    };

    let mut degenerate = 0usize;
    let caps: Vec<f64> = i_avg
        .iter()
        .zip(dvdt.iter())
        .map(|(&i, &slope)| {
            if slope == 0.0 {
                degenerate += 1;
                f64::NAN
            } else {
                i / slope / 1000.0
            }
        })
        .collect();
    if degenerate > 0 {
        warn!(
            "{} of {} capacitance samples had zero voltage slope",
            degenerate,
            caps.len()
        );
    }
    Ok(Array1::from_vec(caps))
}

/// Per-cycle metric row, one per assembled cycle.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub cycle_index: usize,
    pub cycle_time_s: f64,
    pub coulombic_efficiency_pct: f64,
    pub energy_efficiency_pct: f64,
    pub resistance_ohm: f64,
    /// Present only when mass normalization is enabled.
    pub gravimetric_capacitance_f_per_g: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub rows: Vec<CycleMetrics>,
    /// Cycle indices where at least one metric degenerated to NaN.
    pub degenerate_cycles: Vec<usize>,
    pub params_hash: String,
}

/// One GCD run plus its memoized detection and metric state.
#[derive(Debug)]
pub struct GcdAnalysis {
    data: DataSet,
    config: AnalysisConfig,
    current_regions: Option<Vec<CurrentRegion>>,
    voltage_holds: Option<Vec<VoltageHoldRegion>>,
    half_cycles: Option<Vec<HalfCycleRegion>>,
    assembly: Option<CycleAssembly>,
    power_w: Option<Array1<f64>>,
    charge_c: Option<Array1<f64>>,
    energy_j: Option<Array1<f64>>,
}

impl GcdAnalysis {
    /// The store must expose time, voltage and current through the `t`, `E`
    /// and `I` names (directly or via aliases).
    pub fn new(data: DataSet, config: AnalysisConfig) -> Result<Self, GcdError> {
        for required in ["t", "E", "I"] {
            data.field(required)?;
        }
        Ok(Self {
            data,
            config,
            current_regions: None,
            voltage_holds: None,
            half_cycles: None,
            assembly: None,
            power_w: None,
            charge_c: None,
            energy_j: None,
        })
    }

    pub fn data(&self) -> &DataSet {
        &self.data
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn current_regions(&mut self) -> Result<&[CurrentRegion], GcdError> {
        if self.current_regions.is_none() {
            debug!("current regions not cached; detecting with configured parameters");
            let regions = detect_current_regions(self.data.field("I")?, &self.config.current);
            self.current_regions = Some(regions);
        }
        Ok(self.current_regions.as_deref().unwrap_or(&[]))
    }

    pub fn voltage_holds(&mut self) -> Result<&[VoltageHoldRegion], GcdError> {
        if self.voltage_holds.is_none() {
            debug!("voltage holds not cached; detecting with configured parameters");
            let holds = detect_voltage_holds(self.data.field("E")?, &self.config.hold);
            self.voltage_holds = Some(holds);
        }
        Ok(self.voltage_holds.as_deref().unwrap_or(&[]))
    }

    pub fn half_cycles(&mut self) -> Result<&[HalfCycleRegion], GcdError> {
        if self.half_cycles.is_none() {
            self.current_regions()?;
            self.voltage_holds()?;
            debug!("half-cycles not cached; detecting with configured parameters");
            let halves = detect_half_cycles(
                self.current_regions.as_deref().unwrap_or(&[]),
                self.data.field("E")?,
                self.voltage_holds.as_deref().unwrap_or(&[]),
                &self.config.half_cycle,
            );
            self.half_cycles = Some(halves);
        }
        Ok(self.half_cycles.as_deref().unwrap_or(&[]))
    }

    pub fn cycles(&mut self) -> Result<&CycleAssembly, GcdError> {
        if self.assembly.is_none() {
            self.half_cycles()?;
            let assembly = assemble_cycles(
                self.half_cycles.as_deref().unwrap_or(&[]),
                self.voltage_holds.as_deref().unwrap_or(&[]),
            );
            debug!(
                cycles = assembly.summary.cycles_emitted,
                "assembled charge-discharge cycles"
            );
            self.assembly = Some(assembly);
        }
        self.assembly.as_ref().ok_or(GcdError::InsufficientData)
    }

    /// Power E*I in watts (voltage in V, current in mA).
    pub fn power(&mut self) -> Result<&Array1<f64>, GcdError> {
        if self.power_w.is_none() {
            let e = self.data.field("E")?;
            let i = self.data.field("I")?;
            let p: Vec<f64> = e
                .iter()
                .zip(i.iter())
                .map(|(&e, &i)| e * i / 1000.0)
                .collect();
            self.power_w = Some(Array1::from_vec(p));
        }
        self.power_w.as_ref().ok_or(GcdError::InsufficientData)
    }

    /// Charge passed in coulombs: trapezoidal integral of the current.
    pub fn cumulative_charge(&mut self) -> Result<&Array1<f64>, GcdError> {
        if self.charge_c.is_none() {
            debug!("cumulative charge not cached; integrating current");
            let i = self.data.field("I")?;
            let t = self.data.field("t")?;
            let q = cumulative_trapezoid(i, t).mapv_into(|v| v / 1000.0);
            self.charge_c = Some(q);
        }
        self.charge_c.as_ref().ok_or(GcdError::InsufficientData)
    }

    /// Energy in joules: trapezoidal integral of the power.
    pub fn cumulative_energy(&mut self) -> Result<&Array1<f64>, GcdError> {
        if self.energy_j.is_none() {
            self.power()?;
            debug!("cumulative energy not cached; integrating power");
            let t = self.data.field("t")?;
            let p = self.power_w.as_ref().ok_or(GcdError::InsufficientData)?;
            let w = cumulative_trapezoid(p, t);
            self.energy_j = Some(w);
        }
        self.energy_j.as_ref().ok_or(GcdError::InsufficientData)
    }

    /// Instantaneous (optionally mass-normalized) capacitance over the
    /// discharge section of one assembled cycle.
    pub fn instantaneous_capacitance(
        &mut self,
        cycle_index: usize,
    ) -> Result<Array1<f64>, GcdError> {
        let scale = self.config.normalization_scale()?;
        self.cycles()?;
        let cycle = self
            .assembly
            .as_ref()
            .and_then(|a| a.cycles.get(cycle_index))
            .cloned()
            .ok_or_else(|| {
                GcdError::InvalidParameter(format!("no assembled cycle {}", cycle_index))
            })?;
        let t = self.data.field("t")?;
        let e = self.data.field("E")?;
        let i = self.data.field("I")?;
        let section = &cycle.discharging;
        if section.end >= t.len() {
            return Err(GcdError::InsufficientData);
        }
        let ts: Vec<f64> = section.indices().map(|k| t[k]).collect();
        let es: Vec<f64> = section.indices().map(|k| e[k]).collect();
        let is: Vec<f64> = section.indices().map(|k| i[k]).collect();
        let caps = discharge_capacitance(&ts, &es, &is, &self.config.capacitance)?;
        Ok(caps.mapv_into(|v| v * scale))
    }

    /// Mean of the instantaneous capacitance over the final
    /// `tail_fraction` of the discharge section. Requires mass normalization
    /// with a non-zero total mass.
    pub fn gravimetric_capacitance(&mut self, cycle_index: usize) -> Result<f64, GcdError> {
        if self.config.capacitance.normalization == MassNormalization::Off {
            return Err(GcdError::MissingMass);
        }
        let tail = self.config.capacitance.tail_fraction;
        if !(tail > 0.0 && tail <= 1.0) {
            return Err(GcdError::InvalidParameter(
                "tail fraction must lie in (0, 1]".to_string(),
            ));
        }
        let caps = self.instantaneous_capacitance(cycle_index)?;
        let n = caps.len();
        if n == 0 {
            warn!("discharge section too short for capacitance estimation");
            return Ok(f64::NAN);
        }
        let count = ((n as f64 * tail).ceil() as usize).clamp(1, n);
        let sum: f64 = caps.iter().skip(n - count).sum();
        Ok(sum / count as f64)
    }

    /// Compute every per-cycle metric. Degenerate cycles contribute NaN rows
    /// and their indices; they never abort the batch.
    pub fn cycle_metrics(&mut self) -> Result<MetricsReport, GcdError> {
        self.cycles()?;
        self.cumulative_charge()?;
        self.cumulative_energy()?;
        let params_hash = self.config.params_hash_sha256()?;
        let normalized = self.config.capacitance.normalization != MassNormalization::Off;
        if normalized {
            // surface the configuration error before walking the batch
            self.config.normalization_scale()?;
        }

        let cycle_count = self
            .assembly
            .as_ref()
            .map(|a| a.cycles.len())
            .unwrap_or(0);
        let mut rows = Vec::with_capacity(cycle_count);
        let mut degenerate = Vec::new();
        for index in 0..cycle_count {
            let (time_s, ce, ee, resistance) = {
                let assembly = self.assembly.as_ref().ok_or(GcdError::InsufficientData)?;
                let cycle = &assembly.cycles[index];
                let t = self.data.field("t")?;
                let e = self.data.field("E")?;
                let i = self.data.field("I")?;
                let q = self.charge_c.as_ref().ok_or(GcdError::InsufficientData)?;
                let w = self.energy_j.as_ref().ok_or(GcdError::InsufficientData)?;
                (
                    cycle_time(cycle, t),
                    coulombic_efficiency(cycle, q),
                    energy_efficiency(cycle, w),
                    ohmic_resistance(cycle, e, i),
                )
            };
            let gravimetric = if normalized {
                Some(self.gravimetric_capacitance(index)?)
            } else {
                None
            };
            let nan = time_s.is_nan()
                || ce.is_nan()
                || ee.is_nan()
                || resistance.is_nan()
                || gravimetric.map_or(false, f64::is_nan);
            if nan {
                degenerate.push(index);
            }
            rows.push(CycleMetrics {
                cycle_index: index,
                cycle_time_s: time_s,
                coulombic_efficiency_pct: ce,
                energy_efficiency_pct: ee,
                resistance_ohm: resistance,
                gravimetric_capacitance_f_per_g: gravimetric,
            });
        }
        Ok(MetricsReport {
            rows,
            degenerate_cycles: degenerate,
            params_hash,
        })
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
