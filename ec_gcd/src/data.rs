//! Named time-series store.
//!
//! A [`DataSet`] maps field names to equal-length `f64` series. One field may
//! be designated the time field (elapsed seconds since [`DataSet::start_time`]);
//! short aliases (`t`, `E`, `I`, ...) resolve to the instrument's column names.
//! Every filtering/combining operation returns a new store; the only in-place
//! mutations are the time-rebasing primitives [`DataSet::zero_time`] and
//! [`DataSet::shift_start_time`].

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::GcdError;

/// Open/closed bound selection for [`DataSet::filter_by_range`]. Both sides
/// closed by default.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub closed_left: bool,
    pub closed_right: bool,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            closed_left: true,
            closed_right: true,
        }
    }
}

/// A time-range endpoint: either elapsed seconds since the store's start time
/// or an absolute timestamp.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TimeBound {
    Elapsed(f64),
    Absolute(DateTime<Utc>),
}

impl From<f64> for TimeBound {
    fn from(value: f64) -> Self {
        TimeBound::Elapsed(value)
    }
}

impl From<DateTime<Utc>> for TimeBound {
    fn from(value: DateTime<Utc>) -> Self {
        TimeBound::Absolute(value)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DataSet {
    fields: BTreeMap<String, Array1<f64>>,
    aliases: BTreeMap<String, String>,
    time_field: Option<String>,
    start_time: Option<DateTime<Utc>>,
}

impl DataSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of samples (all fields are equal length).
    pub fn len(&self) -> usize {
        self.fields.values().next().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.keys().map(|k| k.as_str()).collect()
    }

    /// Resolve `name` to a stored field name: field names take precedence,
    /// then aliases. Unknown names fail with [`GcdError::UnknownField`].
    pub fn resolve(&self, name: &str) -> Result<&str, GcdError> {
        if let Some((key, _)) = self.fields.get_key_value(name) {
            return Ok(key.as_str());
        }
        if let Some(target) = self.aliases.get(name) {
            if let Some((key, _)) = self.fields.get_key_value(target) {
                return Ok(key.as_str());
            }
        }
        Err(GcdError::UnknownField(name.to_string()))
    }

    pub fn field(&self, name: &str) -> Result<&Array1<f64>, GcdError> {
        if let Some(series) = self.fields.get(name) {
            return Ok(series);
        }
        if let Some(target) = self.aliases.get(name) {
            if let Some(series) = self.fields.get(target) {
                return Ok(series);
            }
        }
        Err(GcdError::UnknownField(name.to_string()))
    }

    /// Insert a field; its length must match the fields already present.
    pub fn insert_field(&mut self, name: &str, values: Array1<f64>) -> Result<(), GcdError> {
        if let Some(existing) = self.fields.values().next() {
            if existing.len() != values.len() {
                return Err(GcdError::FieldLengthMismatch {
                    name: name.to_string(),
                    got: values.len(),
                    expected: existing.len(),
                });
            }
        }
        self.fields.insert(name.to_string(), values);
        Ok(())
    }

    /// Install `alias` for `field` if the field exists; returns whether the
    /// alias was installed. Absent columns are skipped so readers can offer a
    /// standard alias set regardless of which columns a file exports.
    pub fn set_alias(&mut self, alias: &str, field: &str) -> bool {
        if self.fields.contains_key(field) {
            self.aliases.insert(alias.to_string(), field.to_string());
            true
        } else {
            false
        }
    }

    pub fn aliases(&self) -> &BTreeMap<String, String> {
        &self.aliases
    }

    pub fn set_time_field(&mut self, name: &str) -> Result<(), GcdError> {
        let key = self.resolve(name)?.to_string();
        self.time_field = Some(key);
        Ok(())
    }

    pub fn time_field(&self) -> Option<&str> {
        self.time_field.as_deref()
    }

    /// The time series, if a time field is configured.
    pub fn time(&self) -> Result<&Array1<f64>, GcdError> {
        let name = self.time_field.as_deref().ok_or(GcdError::NoTimeData)?;
        self.fields.get(name).ok_or(GcdError::NoTimeData)
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn set_start_time(&mut self, start: DateTime<Utc>) {
        self.start_time = Some(start);
    }

    /// `start_time` plus the last elapsed-time sample.
    pub fn end_time(&self) -> Result<DateTime<Utc>, GcdError> {
        let t = self.time()?;
        let start = self.start_time.ok_or(GcdError::NoStartTime)?;
        let last = if t.is_empty() { 0.0 } else { t[t.len() - 1] };
        Ok(start + seconds_to_duration(last))
    }

    /// Move `start_time` so that `end_time` lands on `end`; the elapsed
    /// samples are untouched.
    pub fn set_end_time(&mut self, end: DateTime<Utc>) -> Result<(), GcdError> {
        let current = self.end_time()?;
        let start = self.start_time.ok_or(GcdError::NoStartTime)?;
        self.start_time = Some(start + (end - current));
        Ok(())
    }

    /// Elapsed seconds of the final sample (0 for an empty store).
    pub fn duration_s(&self) -> Result<f64, GcdError> {
        let t = self.time()?;
        Ok(if t.is_empty() { 0.0 } else { t[t.len() - 1] })
    }

    pub fn elapsed_since_start(&self, at: DateTime<Utc>) -> Result<f64, GcdError> {
        let start = self.start_time.ok_or(GcdError::NoStartTime)?;
        Ok(duration_seconds(at - start))
    }

    pub fn datetime_at(&self, elapsed: f64) -> Result<DateTime<Utc>, GcdError> {
        let start = self.start_time.ok_or(GcdError::NoStartTime)?;
        Ok(start + seconds_to_duration(elapsed))
    }

    /// Shift the time series so its first sample reads 0, advancing
    /// `start_time` by the same amount so absolute time is preserved.
    pub fn zero_time(&mut self) -> Result<(), GcdError> {
        let name = self.time_field.clone().ok_or(GcdError::NoTimeData)?;
        let series = self.fields.get_mut(&name).ok_or(GcdError::NoTimeData)?;
        if series.is_empty() {
            return Ok(());
        }
        let delta = series[0];
        series.mapv_inplace(|v| v - delta);
        if let Some(start) = self.start_time {
            self.start_time = Some(start + seconds_to_duration(delta));
        }
        Ok(())
    }

    /// Rebase onto `new_start`, shifting the time series so every sample keeps
    /// its absolute meaning. This is the primitive used to align several
    /// stores onto one shared clock.
    pub fn shift_start_time(&mut self, new_start: DateTime<Utc>) {
        let old = match self.start_time {
            Some(start) => start,
            None => {
                warn!("shifting start time of a store with no start time set; elapsed samples left untouched");
                self.start_time = Some(new_start);
                return;
            }
        };
        if let Some(name) = self.time_field.clone() {
            if let Some(series) = self.fields.get_mut(&name) {
                let offset = duration_seconds(old - new_start);
                series.mapv_inplace(|v| v + offset);
            }
        }
        self.start_time = Some(new_start);
    }

    /// New store keeping only the samples where `name`'s value lies in
    /// `[min, max]`, each side open or closed per `bounds`. The result keeps
    /// the original `start_time`; rebasing is a separate, explicit step.
    /// An empty result is valid.
    pub fn filter_by_range(
        &self,
        name: &str,
        min: f64,
        max: f64,
        bounds: Bounds,
    ) -> Result<DataSet, GcdError> {
        let series = self.field(name)?;
        let mask: Vec<bool> = series
            .iter()
            .map(|&v| {
                let left = if bounds.closed_left { v >= min } else { v > min };
                let right = if bounds.closed_right { v <= max } else { v < max };
                left && right
            })
            .collect();
        Ok(self.masked(&mask))
    }

    /// Closed-closed convenience form of [`DataSet::filter_by_range`].
    pub fn in_range(&self, name: &str, min: f64, max: f64) -> Result<DataSet, GcdError> {
        self.filter_by_range(name, min, max, Bounds::default())
    }

    /// Keep the samples whose time lies between `start` and `end` (closed on
    /// both sides). Bounds may be elapsed seconds or absolute timestamps;
    /// absolute bounds require `start_time` to be set.
    pub fn filter_by_time_range(
        &self,
        start: impl Into<TimeBound>,
        end: impl Into<TimeBound>,
    ) -> Result<DataSet, GcdError> {
        let name = self
            .time_field
            .clone()
            .ok_or(GcdError::NoTimeData)?;
        let start = self.bound_to_elapsed(start.into())?;
        let end = self.bound_to_elapsed(end.into())?;
        self.filter_by_range(&name, start, end, Bounds::default())
    }

    fn bound_to_elapsed(&self, bound: TimeBound) -> Result<f64, GcdError> {
        match bound {
            TimeBound::Elapsed(s) => Ok(s),
            TimeBound::Absolute(at) => self.elapsed_since_start(at),
        }
    }

    /// Concatenate two stores with identical field-name sets. The combined
    /// `start_time` is the earlier of the two and both time series are
    /// re-expressed against it. A store with no start time contributes its
    /// elapsed samples unshifted; when exactly one operand is missing its
    /// start time the combined timeline is suspect and a warning is logged.
    pub fn combine(&self, other: &DataSet) -> Result<DataSet, GcdError> {
        if self.fields.len() != other.fields.len()
            || !self.fields.keys().all(|k| other.fields.contains_key(k))
        {
            return Err(GcdError::FieldSetMismatch);
        }

        let start_time = match (self.start_time, other.start_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => {
                warn!("combining a store with a start time and one without; combined timeline is likely wrong");
                Some(a)
            }
            (None, Some(b)) => {
                warn!("combining a store with a start time and one without; combined timeline is likely wrong");
                Some(b)
            }
            (None, None) => None,
        };

        let offset = |op: Option<DateTime<Utc>>| -> f64 {
            match (op, start_time) {
                (Some(o), Some(c)) => duration_seconds(o - c),
                _ => 0.0,
            }
        };
        let self_offset = offset(self.start_time);
        let other_offset = offset(other.start_time);

        let mut fields = BTreeMap::new();
        for (name, series) in &self.fields {
            let other_series = other
                .fields
                .get(name)
                .ok_or(GcdError::FieldSetMismatch)?;
            let is_time = self.time_field.as_deref() == Some(name.as_str());
            let mut values: Vec<f64> = Vec::with_capacity(series.len() + other_series.len());
            if is_time {
                values.extend(series.iter().map(|&v| v + self_offset));
                values.extend(other_series.iter().map(|&v| v + other_offset));
            } else {
                values.extend(series.iter().copied());
                values.extend(other_series.iter().copied());
            }
            fields.insert(name.clone(), Array1::from_vec(values));
        }

        Ok(DataSet {
            fields,
            aliases: self.aliases.clone(),
            time_field: self.time_field.clone(),
            start_time,
        })
    }

    /// Valid-mode uniform-kernel moving average: output length `n - w + 1`.
    /// A window larger than the series yields an empty array; a zero window
    /// is a configuration error.
    pub fn rolling_average(&self, name: &str, window: usize) -> Result<Array1<f64>, GcdError> {
        if window == 0 {
            return Err(GcdError::InvalidParameter(
                "window size must be greater than 0".to_string(),
            ));
        }
        let series = self.field(name)?;
        let values: Vec<f64> = series.iter().copied().collect();
        Ok(Array1::from_vec(crate::rolling_mean(&values, window)))
    }

    /// [`DataSet::rolling_average`] over several fields at once.
    pub fn rolling_averages(
        &self,
        names: &[&str],
        window: usize,
    ) -> Result<Vec<Array1<f64>>, GcdError> {
        names
            .iter()
            .map(|name| self.rolling_average(name, window))
            .collect()
    }

    /// Partition into contiguous runs by how many `thresholds` each value of
    /// `name` sits at or above. Runs are half-open on the right, so the
    /// returned stores are contiguous and non-overlapping.
    pub fn split_at_threshold_crossings(
        &self,
        name: &str,
        thresholds: &[f64],
    ) -> Result<Vec<DataSet>, GcdError> {
        let series = self.field(name)?;
        let n = series.len();
        let mut out = Vec::new();
        if n == 0 {
            return Ok(out);
        }
        let region_id = |v: f64| thresholds.iter().filter(|&&th| v >= th).count();
        let mut run_start = 0usize;
        let mut run_id = region_id(series[0]);
        for i in 1..n {
            let id = region_id(series[i]);
            if id != run_id {
                out.push(self.slice_rows(run_start, i));
                run_start = i;
                run_id = id;
            }
        }
        out.push(self.slice_rows(run_start, n));
        Ok(out)
    }

    fn masked(&self, mask: &[bool]) -> DataSet {
        let mut fields = BTreeMap::new();
        for (name, series) in &self.fields {
            let values: Vec<f64> = series
                .iter()
                .zip(mask)
                .filter(|(_, &keep)| keep)
                .map(|(&v, _)| v)
                .collect();
            fields.insert(name.clone(), Array1::from_vec(values));
        }
        DataSet {
            fields,
            aliases: self.aliases.clone(),
            time_field: self.time_field.clone(),
            start_time: self.start_time,
        }
    }

    /// Rows `[start, end)` of every field, bookkeeping carried over.
    fn slice_rows(&self, start: usize, end: usize) -> DataSet {
        let mut fields = BTreeMap::new();
        for (name, series) in &self.fields {
            let values: Vec<f64> = series
                .iter()
                .skip(start)
                .take(end.saturating_sub(start))
                .copied()
                .collect();
            fields.insert(name.clone(), Array1::from_vec(values));
        }
        DataSet {
            fields,
            aliases: self.aliases.clone(),
            time_field: self.time_field.clone(),
            start_time: self.start_time,
        }
    }
}

/// Align every store onto the earliest start time present. Stores with no
/// start time cannot be placed on the shared clock and are skipped with a
/// warning.
pub fn sync_times(stores: &mut [DataSet]) {
    let earliest = stores.iter().filter_map(|s| s.start_time()).min();
    let earliest = match earliest {
        Some(t) => t,
        None => return,
    };
    for store in stores.iter_mut() {
        if store.start_time().is_some() {
            store.shift_start_time(earliest);
        } else {
            warn!("store without a start time left out of time sync");
        }
    }
}

pub(crate) fn duration_seconds(d: Duration) -> f64 {
    match d.num_microseconds() {
        Some(us) => us as f64 / 1e6,
        None => d.num_milliseconds() as f64 / 1000.0,
    }
}

fn seconds_to_duration(secs: f64) -> Duration {
    Duration::microseconds((secs * 1e6).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ndarray::array;

    fn sample() -> DataSet {
        let mut d = DataSet::new();
        let t: Vec<f64> = (0..11).map(|i| i as f64).collect();
        let signal: Vec<f64> = t.iter().map(|v| v.sin()).collect();
        d.insert_field("Time", Array1::from_vec(t)).unwrap();
        d.insert_field("Signal", Array1::from_vec(signal)).unwrap();
        d.set_time_field("Time").unwrap();
        d.set_start_time(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap());
        d
    }

    #[test]
    fn insert_field_rejects_length_mismatch() {
        let mut d = sample();
        let err = d.insert_field("Short", array![1.0, 2.0]).unwrap_err();
        assert!(matches!(err, GcdError::FieldLengthMismatch { .. }));
    }

    #[test]
    fn resolve_fails_closed_on_unknown_names() {
        let mut d = sample();
        assert!(d.set_alias("s", "Signal"));
        assert!(!d.set_alias("x", "Nonexistent"));
        assert_eq!(d.resolve("Signal").unwrap(), "Signal");
        assert_eq!(d.resolve("s").unwrap(), "Signal");
        assert!(matches!(
            d.resolve("nope"),
            Err(GcdError::UnknownField(_))
        ));
    }

    #[test]
    fn filter_masks_every_open_closed_combination() {
        let mut d = DataSet::new();
        d.insert_field("x", array![0.0, 1.0, 2.0, 3.0, 4.0]).unwrap();
        let cases = [
            (true, true, vec![1.0, 2.0, 3.0]),
            (false, true, vec![2.0, 3.0]),
            (true, false, vec![1.0, 2.0]),
            (false, false, vec![2.0]),
        ];
        for (closed_left, closed_right, expected) in cases {
            let got = d
                .filter_by_range(
                    "x",
                    1.0,
                    3.0,
                    Bounds {
                        closed_left,
                        closed_right,
                    },
                )
                .unwrap();
            assert_eq!(got.field("x").unwrap().to_vec(), expected);
        }
    }

    #[test]
    fn filter_is_idempotent() {
        let d = sample();
        let once = d.in_range("Signal", -0.5, 0.5).unwrap();
        let twice = once.in_range("Signal", -0.5, 0.5).unwrap();
        assert_eq!(
            once.field("Signal").unwrap().to_vec(),
            twice.field("Signal").unwrap().to_vec()
        );
        assert_eq!(
            once.field("Time").unwrap().to_vec(),
            twice.field("Time").unwrap().to_vec()
        );
    }

    #[test]
    fn filter_keeps_start_time_and_allows_empty_result() {
        let d = sample();
        let empty = d.in_range("Signal", 10.0, 20.0).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.start_time(), d.start_time());
    }

    #[test]
    fn time_range_accepts_datetimes() {
        let d = sample();
        let start = d.datetime_at(3.0).unwrap();
        let end = d.datetime_at(7.0).unwrap();
        let filtered = d.filter_by_time_range(start, end).unwrap();
        let t = filtered.field("Time").unwrap();
        assert!(t.iter().all(|&v| (3.0..=7.0).contains(&v)));
        assert_eq!(t.len(), 5);
    }

    #[test]
    fn time_range_full_span_round_trips() {
        let d = sample();
        let start = d.start_time().unwrap();
        let end = d.end_time().unwrap();
        let filtered = d.filter_by_time_range(start, end).unwrap();
        for name in d.field_names() {
            assert_eq!(
                filtered.field(name).unwrap().to_vec(),
                d.field(name).unwrap().to_vec()
            );
        }
    }

    #[test]
    fn time_range_without_time_field_errors() {
        let mut d = DataSet::new();
        d.insert_field("x", array![1.0, 2.0]).unwrap();
        assert!(matches!(
            d.filter_by_time_range(0.0, 1.0),
            Err(GcdError::NoTimeData)
        ));
    }

    #[test]
    fn zero_time_preserves_absolute_time() {
        let d = sample();
        let mut shifted = d.in_range("Time", 3.0, 7.0).unwrap();
        let end_before = shifted.end_time().unwrap();
        shifted.zero_time().unwrap();
        assert_eq!(shifted.field("Time").unwrap()[0], 0.0);
        assert_eq!(shifted.end_time().unwrap(), end_before);
    }

    #[test]
    fn shift_start_time_keeps_sample_meaning() {
        let mut d = sample();
        let stamp_of_t5 = d.datetime_at(5.0).unwrap();
        let new_start = Utc.with_ymd_and_hms(2022, 12, 31, 0, 0, 0).unwrap();
        d.shift_start_time(new_start);
        assert_eq!(d.start_time().unwrap(), new_start);
        let t = d.field("Time").unwrap();
        assert_eq!(d.datetime_at(t[5]).unwrap(), stamp_of_t5);
    }

    #[test]
    fn set_end_time_shifts_start_and_keeps_duration() {
        let mut d = sample();
        let duration = d.end_time().unwrap() - d.start_time().unwrap();
        let new_end = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        d.set_end_time(new_end).unwrap();
        assert_eq!(d.end_time().unwrap(), new_end);
        assert_eq!(d.end_time().unwrap() - d.start_time().unwrap(), duration);
    }

    #[test]
    fn combine_concatenates_and_realigns_time() {
        let mut a = sample();
        let mut b = sample();
        // b starts one minute after a
        b.set_start_time(a.start_time().unwrap() + Duration::seconds(60));
        let combined = a.combine(&b).unwrap();
        assert_eq!(combined.len(), a.len() + b.len());
        assert_eq!(combined.start_time(), a.start_time());
        let t = combined.field("Time").unwrap();
        assert_eq!(t[0], 0.0);
        assert_eq!(t[11], 60.0);
        // mutating the operands afterwards must not affect the result
        a.zero_time().unwrap();
        b.zero_time().unwrap();
        assert_eq!(combined.len(), 22);
    }

    #[test]
    fn combine_rejects_disjoint_field_sets() {
        let a = sample();
        let mut b = DataSet::new();
        b.insert_field("Other", array![1.0]).unwrap();
        assert!(matches!(a.combine(&b), Err(GcdError::FieldSetMismatch)));
    }

    #[test]
    fn rolling_average_length_law() {
        let d = sample();
        for w in 1..=11 {
            let avg = d.rolling_average("Signal", w).unwrap();
            assert_eq!(avg.len(), 11 - w + 1);
        }
        let avg = d.rolling_average("Signal", 3).unwrap();
        let signal = d.field("Signal").unwrap();
        let first = (signal[0] + signal[1] + signal[2]) / 3.0;
        assert!((avg[0] - first).abs() < 1e-12);
    }

    #[test]
    fn rolling_average_rejects_zero_window() {
        let d = sample();
        assert!(matches!(
            d.rolling_average("Signal", 0),
            Err(GcdError::InvalidParameter(_))
        ));
    }

    #[test]
    fn split_at_threshold_crossings_partitions_contiguously() {
        let mut d = DataSet::new();
        d.insert_field("x", array![0.0, 0.5, 1.5, 2.5, 2.5, 0.2, 1.1])
            .unwrap();
        let parts = d.split_at_threshold_crossings("x", &[1.0, 2.0]).unwrap();
        let lens: Vec<usize> = parts.iter().map(|p| p.len()).collect();
        assert_eq!(lens, vec![2, 1, 2, 1, 1]);
        assert_eq!(lens.iter().sum::<usize>(), d.len());
        assert_eq!(parts[0].field("x").unwrap().to_vec(), vec![0.0, 0.5]);
        assert_eq!(parts[2].field("x").unwrap().to_vec(), vec![2.5, 2.5]);
    }

    #[test]
    fn sync_times_aligns_to_earliest_start() {
        let a = sample();
        let mut b = sample();
        b.set_start_time(a.start_time().unwrap() + Duration::seconds(30));
        let b_end = b.end_time().unwrap();
        let mut stores = [a, b];
        sync_times(&mut stores);
        assert_eq!(stores[0].start_time(), stores[1].start_time());
        assert_eq!(stores[1].end_time().unwrap(), b_end);
        assert_eq!(stores[1].field("Time").unwrap()[0], 30.0);
    }
}
