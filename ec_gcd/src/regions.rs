//! Region detection for GCD series.
//!
//! Three passes classify every sample index of one store into typed regions:
//! current-polarity regions, voltage-hold plateaus, and charging/discharging
//! half-cycles (current polarity crossed with voltage polarity, force-split at
//! holds). All detectors are pure functions of their input series and can be
//! re-run at will.
//!
//! Region indices are expressed as `start..=end` with `end` the inclusive
//! index of the last sample in the region; regions own no data and are
//! invalidated by any operation that produces a new store.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::linreg_slope;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Polarity {
    Positive,
    Negative,
    Zero,
}

impl Polarity {
    /// Sign classification against a noise threshold: strictly above
    /// `zero_threshold` is positive, strictly below its negation is negative,
    /// the band in between is zero.
    pub fn classify(value: f64, zero_threshold: f64) -> Self {
        if value > zero_threshold {
            Polarity::Positive
        } else if value < -zero_threshold {
            Polarity::Negative
        } else {
            Polarity::Zero
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Charging,
    Discharging,
}

/// Maximal run of samples sharing one current polarity.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CurrentRegion {
    pub polarity: Polarity,
    pub start: usize,
    pub end: usize,
}

/// Charging or discharging stretch inside a non-zero current region.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HalfCycleRegion {
    pub direction: Direction,
    pub start: usize,
    pub end: usize,
}

/// Constant-voltage dwell; `hold_value` is the mean voltage over the run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoltageHoldRegion {
    pub hold_value: f64,
    pub start: usize,
    pub end: usize,
}

/// Tagged union over the region kinds, used wherever regions of different
/// kinds travel together (cycle assembly, plotting consumers).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Region {
    Current(CurrentRegion),
    HalfCycle(HalfCycleRegion),
    VoltageHold(VoltageHoldRegion),
}

impl Region {
    pub fn start_index(&self) -> usize {
        match self {
            Region::Current(r) => r.start,
            Region::HalfCycle(r) => r.start,
            Region::VoltageHold(r) => r.start,
        }
    }

    pub fn end_index(&self) -> usize {
        match self {
            Region::Current(r) => r.end,
            Region::HalfCycle(r) => r.end,
            Region::VoltageHold(r) => r.end,
        }
    }

    pub fn len(&self) -> usize {
        self.end_index() - self.start_index() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

macro_rules! region_len {
    ($ty:ty) => {
        impl $ty {
            pub fn len(&self) -> usize {
                self.end - self.start + 1
            }

            pub fn is_empty(&self) -> bool {
                false
            }

            /// Index range covering the region, usable for slicing.
            pub fn indices(&self) -> std::ops::Range<usize> {
                self.start..self.end + 1
            }
        }
    };
}

region_len!(CurrentRegion);
region_len!(HalfCycleRegion);
region_len!(VoltageHoldRegion);

/// One detection phase's tuning knobs. Each phase carries its own defaults;
/// see the constructors.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub zero_threshold: f64,
    pub min_region_length: usize,
}

impl DetectorConfig {
    /// Current-polarity detection: 0.1 mA dead band, 5-sample minimum.
    pub fn current_default() -> Self {
        Self {
            zero_threshold: 0.1,
            min_region_length: 5,
        }
    }

    /// Voltage-hold detection: 1 mV dead band, 25-sample minimum.
    pub fn hold_default() -> Self {
        Self {
            zero_threshold: 0.001,
            min_region_length: 25,
        }
    }

    /// Half-cycle detection: 1 mV dead band, 5-sample minimum.
    pub fn half_cycle_default() -> Self {
        Self {
            zero_threshold: 0.001,
            min_region_length: 5,
        }
    }
}

/// Single forward walk over the current series. A run closes when the sample
/// classification changes; runs shorter than `min_region_length` are dropped,
/// not merged into their neighbours. The final open run goes through the same
/// length check.
pub fn detect_current_regions(
    current: &Array1<f64>,
    cfg: &DetectorConfig,
) -> Vec<CurrentRegion> {
    let n = current.len();
    let mut regions = Vec::new();
    if n == 0 {
        return regions;
    }
    let mut run_start = 0usize;
    let mut run_class = Polarity::classify(current[0], cfg.zero_threshold);
    for i in 1..n {
        let class = Polarity::classify(current[i], cfg.zero_threshold);
        if class != run_class {
            if i - run_start >= cfg.min_region_length {
                regions.push(CurrentRegion {
                    polarity: run_class,
                    start: run_start,
                    end: i - 1,
                });
            }
            run_start = i;
            run_class = class;
        }
    }
    if n - run_start >= cfg.min_region_length {
        regions.push(CurrentRegion {
            polarity: run_class,
            start: run_start,
            end: n - 1,
        });
    }
    regions
}

/// Walk the voltage series growing a run while each sample stays within
/// `zero_threshold` of the run's running mean. A closed run is kept only when
/// it is longer than `min_region_length` AND flat under a linear-regression
/// slope test, which rejects slow monotonic drifts that still satisfy the
/// pointwise mean test.
pub fn detect_voltage_holds(
    voltage: &Array1<f64>,
    cfg: &DetectorConfig,
) -> Vec<VoltageHoldRegion> {
    let n = voltage.len();
    let mut holds = Vec::new();
    if n == 0 {
        return holds;
    }
    let mut start = 0usize;
    let mut mean = voltage[0];
    let mut count = 1usize;
    for i in 1..n {
        let v = voltage[i];
        if (v - mean).abs() < cfg.zero_threshold {
            count += 1;
            mean += (v - mean) / count as f64;
        } else {
            push_hold_if_flat(&mut holds, voltage, start, i - 1, mean, cfg);
            start = i;
            mean = v;
            count = 1;
        }
    }
    push_hold_if_flat(&mut holds, voltage, start, n - 1, mean, cfg);
    holds
}

fn push_hold_if_flat(
    out: &mut Vec<VoltageHoldRegion>,
    voltage: &Array1<f64>,
    start: usize,
    end: usize,
    mean: f64,
    cfg: &DetectorConfig,
) {
    let len = end - start + 1;
    if len <= cfg.min_region_length {
        return;
    }
    let xs: Vec<f64> = (0..len).map(|k| k as f64).collect();
    let ys: Vec<f64> = (start..=end).map(|i| voltage[i]).collect();
    let slope = linreg_slope(&xs, &ys);
    let limit = 2.0 * cfg.zero_threshold / len as f64 * 0.25;
    if slope.abs() < limit {
        out.push(VoltageHoldRegion {
            hold_value: mean,
            start,
            end,
        });
    }
}

/// Classify each non-zero current region into charging/discharging runs.
/// Same-sign current and voltage means charging, opposite signs discharging;
/// zero-voltage samples never contribute. Runs are additionally terminated at
/// any index falling inside a detected voltage hold, even when the voltage
/// polarity has not changed.
pub fn detect_half_cycles(
    current_regions: &[CurrentRegion],
    voltage: &Array1<f64>,
    holds: &[VoltageHoldRegion],
    cfg: &DetectorConfig,
) -> Vec<HalfCycleRegion> {
    let n = voltage.len();
    let mut in_hold = vec![false; n];
    for hold in holds {
        for i in hold.start..=hold.end.min(n.saturating_sub(1)) {
            in_hold[i] = true;
        }
    }

    let mut out = Vec::new();
    for region in current_regions {
        if region.polarity == Polarity::Zero || region.end >= n {
            continue;
        }
        let mut run: Option<(usize, Direction)> = None;
        for i in region.start..=region.end {
            let class = if in_hold[i] {
                None
            } else {
                match Polarity::classify(voltage[i], cfg.zero_threshold) {
                    Polarity::Zero => None,
                    vp => Some(direction_for(region.polarity, vp)),
                }
            };
            run = match (run, class) {
                (Some((start, dir)), Some(c)) if c == dir => Some((start, dir)),
                (Some((start, dir)), next) => {
                    push_half_cycle(&mut out, start, i - 1, dir, cfg);
                    next.map(|d| (i, d))
                }
                (None, next) => next.map(|d| (i, d)),
            };
        }
        if let Some((start, dir)) = run {
            push_half_cycle(&mut out, start, region.end, dir, cfg);
        }
    }
    out
}

fn direction_for(current: Polarity, volt: Polarity) -> Direction {
    if current == volt {
        Direction::Charging
    } else {
        Direction::Discharging
    }
}

fn push_half_cycle(
    out: &mut Vec<HalfCycleRegion>,
    start: usize,
    end: usize,
    direction: Direction,
    cfg: &DetectorConfig,
) {
    if end - start + 1 >= cfg.min_region_length {
        out.push(HalfCycleRegion {
            direction,
            start,
            end,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    fn cfg(threshold: f64, min_len: usize) -> DetectorConfig {
        DetectorConfig {
            zero_threshold: threshold,
            min_region_length: min_len,
        }
    }

    /// +1 mA / -1 mA square wave, `half` samples per level, `periods` levels.
    fn square_wave(half: usize, periods: usize) -> Array1<f64> {
        let mut out = Vec::with_capacity(half * periods);
        for p in 0..periods {
            let level = if p % 2 == 0 { 1.0 } else { -1.0 };
            out.extend(std::iter::repeat(level).take(half));
        }
        Array1::from_vec(out)
    }

    #[test]
    fn square_wave_current_regions() {
        let current = square_wave(50, 4);
        let regions = detect_current_regions(&current, &cfg(0.1, 5));
        assert_eq!(regions.len(), 4);
        for (k, region) in regions.iter().enumerate() {
            assert_eq!(region.len(), 50);
            let expected = if k % 2 == 0 {
                Polarity::Positive
            } else {
                Polarity::Negative
            };
            assert_eq!(region.polarity, expected);
        }
    }

    #[test]
    fn current_regions_cover_series_when_no_run_is_short() {
        let current = square_wave(10, 6);
        let regions = detect_current_regions(&current, &cfg(0.1, 5));
        let mut next = 0usize;
        for region in &regions {
            assert_eq!(region.start, next);
            next = region.end + 1;
            for i in region.indices() {
                assert_eq!(
                    Polarity::classify(current[i], 0.1),
                    region.polarity
                );
            }
        }
        assert_eq!(next, current.len());
    }

    #[test]
    fn short_runs_are_dropped_not_merged() {
        // 8 positive, 2 zero, 8 negative; the zero blip disappears
        let mut v = vec![1.0; 8];
        v.extend([0.0, 0.0]);
        v.extend(vec![-1.0; 8]);
        let regions = detect_current_regions(&Array1::from_vec(v), &cfg(0.1, 5));
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].end, 7);
        assert_eq!(regions[1].start, 10);
    }

    #[test]
    fn trailing_run_respects_min_length() {
        let mut v = vec![1.0; 10];
        v.extend([-1.0, -1.0, -1.0]);
        let regions = detect_current_regions(&Array1::from_vec(v), &cfg(0.1, 5));
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].polarity, Polarity::Positive);
    }

    #[test]
    fn voltage_hold_on_noisy_plateau() {
        // ramp up, flat plateau with sub-threshold noise, ramp down
        let mut v: Vec<f64> = (0..30).map(|i| i as f64 * 0.05).collect();
        let plateau = 1.45;
        for k in 0..40 {
            let noise = if k % 2 == 0 { 2e-4 } else { -2e-4 };
            v.push(plateau + noise);
        }
        v.extend((0..30).map(|i| plateau - i as f64 * 0.05));
        let holds = detect_voltage_holds(&Array1::from_vec(v), &cfg(0.001, 25));
        assert_eq!(holds.len(), 1);
        assert!(holds[0].len() >= 40);
        assert!((holds[0].hold_value - plateau).abs() < 1e-3);
    }

    #[test]
    fn slow_drift_is_not_a_hold() {
        // every sample stays within the dead band of the running mean, so the
        // run survives the whole series; only the slope test rejects it
        let n = 60;
        let v: Vec<f64> = (0..n).map(|i| i as f64 * 2.5e-5).collect();
        let holds = detect_voltage_holds(&Array1::from_vec(v), &cfg(0.001, 25));
        assert!(holds.is_empty());
    }

    #[test]
    fn half_cycles_from_square_wave() {
        let current = square_wave(50, 4);
        let t: Vec<f64> = (0..200).map(|i| i as f64).collect();
        let voltage = crate::cumulative_trapezoid(
            &current,
            &Array1::from_vec(t),
        );
        let current_regions = detect_current_regions(&current, &cfg(0.1, 5));
        let halves = detect_half_cycles(&current_regions, &voltage, &[], &cfg(0.001, 5));
        assert_eq!(halves.len(), 4);
        assert_eq!(halves[0].direction, Direction::Charging);
        assert_eq!(halves[1].direction, Direction::Discharging);
        assert_eq!(halves[2].direction, Direction::Charging);
        assert_eq!(halves[3].direction, Direction::Discharging);
    }

    #[test]
    fn holds_split_half_cycles() {
        // one positive-current region whose middle is a detected hold
        let n = 60;
        let current = Array1::from_vec(vec![1.0; n]);
        let voltage = Array1::from_vec((0..n).map(|i| 0.1 + i as f64 * 0.01).collect());
        let current_regions = detect_current_regions(&current, &cfg(0.1, 5));
        let hold = VoltageHoldRegion {
            hold_value: 0.3,
            start: 20,
            end: 39,
        };
        let halves =
            detect_half_cycles(&current_regions, &voltage, &[hold], &cfg(0.001, 5));
        assert_eq!(halves.len(), 2);
        assert_eq!((halves[0].start, halves[0].end), (0, 19));
        assert_eq!((halves[1].start, halves[1].end), (40, 59));
        assert!(halves.iter().all(|h| h.direction == Direction::Charging));
    }

    #[test]
    fn negative_cell_charges_on_negative_current() {
        let n = 30;
        let current = Array1::from_vec(vec![-1.0; n]);
        let voltage = Array1::from_vec((0..n).map(|i| -0.1 - i as f64 * 0.01).collect());
        let current_regions = detect_current_regions(&current, &cfg(0.1, 5));
        let halves = detect_half_cycles(&current_regions, &voltage, &[], &cfg(0.001, 5));
        assert_eq!(halves.len(), 1);
        assert_eq!(halves[0].direction, Direction::Charging);
    }
}
