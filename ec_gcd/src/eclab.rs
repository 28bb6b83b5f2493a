//! Readers for BioLogic ECLab exports (`.txt`, `.csv`) and the lab's CO2
//! logger, producing populated [`DataSet`] stores.
//!
//! ECLab text exports are latin1-encoded and tab-delimited; the time column
//! may carry either elapsed seconds or absolute dates. CSV exports are
//! semicolon-delimited with a "Technique started on" stamp on the first line.

use std::fs;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use ndarray::Array1;
use tracing::debug;

use crate::data::{duration_seconds, DataSet};
use crate::GcdError;

pub const ECLAB_TIME_FORMAT: &str = "%m/%d/%Y %H:%M:%S%.f";
pub const CO2_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

const ECLAB_TIME_COLUMN: &str = "time/s";

/// Read an ECLab export, dispatching on the file extension.
pub fn read_eclab(path: &Path) -> Result<DataSet, GcdError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "txt" => read_eclab_txt(path),
        "csv" => read_eclab_csv(path),
        other => Err(GcdError::UnsupportedFormat(other.to_string())),
    }
}

/// Tab-delimited ECLab export. The header line carries a trailing delimiter,
/// so its final empty token is dropped. A time column holding absolute dates
/// (detected by a `:` in the first data row) sets the store's start time and
/// the series is re-expressed as elapsed seconds.
pub fn read_eclab_txt(path: &Path) -> Result<DataSet, GcdError> {
    let bytes =
        fs::read(path).map_err(|e| GcdError::EcLabParse(format!("{}: {}", path.display(), e)))?;
    let text = latin1_to_string(&bytes);
    let mut lines = text.lines();
    let header = lines
        .next()
        .ok_or_else(|| GcdError::EcLabParse(format!("{}: empty file", path.display())))?;
    let mut names: Vec<String> = header.split('\t').map(clean_column_name).collect();
    names.pop();
    if names.is_empty() {
        return Err(GcdError::EcLabParse(format!(
            "{}: no data columns",
            path.display()
        )));
    }

    let time_index = names.iter().position(|n| n == ECLAB_TIME_COLUMN);
    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); names.len()];
    let mut start_time: Option<DateTime<Utc>> = None;
    let mut dates = false;
    let mut first_row = true;
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let cells: Vec<&str> = line.split('\t').collect();
        if first_row {
            first_row = false;
            if let Some(index) = time_index {
                if let Some(cell) = cells.get(index) {
                    if cell.contains(':') {
                        dates = true;
                        start_time = Some(parse_datetime(cell, ECLAB_TIME_FORMAT).ok_or_else(
                            || {
                                GcdError::EcLabParse(format!(
                                    "{}: bad start date '{}'",
                                    path.display(),
                                    cell.trim()
                                ))
                            },
                        )?);
                    }
                }
            }
        }
        record_row(&mut columns, &cells, time_index, dates, start_time)?;
    }

    let mut data = DataSet::new();
    for (name, column) in names.iter().zip(columns) {
        data.insert_field(name, Array1::from_vec(column))?;
    }
    if time_index.is_some() {
        data.set_time_field(ECLAB_TIME_COLUMN)?;
    }
    if let Some(start) = start_time {
        data.set_start_time(start);
    }
    install_standard_aliases(&mut data);
    if dates {
        data.zero_time()?;
    }
    Ok(data)
}

/// Semicolon-delimited ECLab export. The first line reads
/// `"Technique started on : ";<date>` and sets the start time; the time
/// series is zeroed onto its first sample without moving the start time,
/// which therefore marks the start of the technique rather than the first
/// retained sample.
pub fn read_eclab_csv(path: &Path) -> Result<DataSet, GcdError> {
    let bytes =
        fs::read(path).map_err(|e| GcdError::EcLabParse(format!("{}: {}", path.display(), e)))?;
    let text = latin1_to_string(&bytes);
    let mut lines = text.lines();
    let stamp_line = lines
        .next()
        .ok_or_else(|| GcdError::EcLabParse(format!("{}: empty file", path.display())))?;
    let raw_stamp = stamp_line.split(';').last().unwrap_or("");
    let stamp = pad_fractional_seconds(raw_stamp.trim().trim_matches('"'));
    let start_time = parse_datetime(&stamp, ECLAB_TIME_FORMAT).ok_or_else(|| {
        GcdError::EcLabParse(format!("{}: bad start date '{}'", path.display(), stamp))
    })?;

    let header = lines
        .next()
        .ok_or_else(|| GcdError::EcLabParse(format!("{}: missing header", path.display())))?;
    let names: Vec<String> = header.split(';').map(clean_column_name).collect();
    if names.is_empty() {
        return Err(GcdError::EcLabParse(format!(
            "{}: no data columns",
            path.display()
        )));
    }

    let time_index = names.iter().position(|n| n == ECLAB_TIME_COLUMN);
    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); names.len()];
    let mut dates = false;
    let mut first_row = true;
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let cells: Vec<&str> = line.split(';').collect();
        if first_row {
            first_row = false;
            if let Some(index) = time_index {
                if let Some(cell) = cells.get(index) {
                    if cell.contains(':') {
                        dates = true;
                    }
                }
            }
        }
        record_row(&mut columns, &cells, time_index, dates, Some(start_time))?;
    }

    // the stamp on line one is the technique start; elapsed samples are
    // rebased onto their first retained value while the stamp stays put
    if let Some(index) = time_index {
        if let Some(first) = columns[index].first().copied() {
            for value in &mut columns[index] {
                *value -= first;
            }
        }
    }

    let mut data = DataSet::new();
    for (name, column) in names.iter().zip(columns) {
        data.insert_field(name, Array1::from_vec(column))?;
    }
    if time_index.is_some() {
        data.set_time_field(ECLAB_TIME_COLUMN)?;
    }
    data.set_start_time(start_time);
    install_standard_aliases(&mut data);
    Ok(data)
}

/// CO2 logger export: one `date,value` pair per line. Malformed rows are
/// skipped; the first valid date becomes the start time.
pub fn read_co2_txt(path: &Path) -> Result<DataSet, GcdError> {
    let bytes =
        fs::read(path).map_err(|e| GcdError::Co2Parse(format!("{}: {}", path.display(), e)))?;
    let text = latin1_to_string(&bytes);
    let mut times = Vec::new();
    let mut values = Vec::new();
    let mut start_time: Option<DateTime<Utc>> = None;
    let mut skipped = 0usize;
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Some((date, value)) = line.split_once(',') else {
            skipped += 1;
            continue;
        };
        let (Some(at), Ok(v)) = (
            parse_datetime(date, CO2_TIME_FORMAT),
            value.trim().parse::<f64>(),
        ) else {
            skipped += 1;
            continue;
        };
        let start = *start_time.get_or_insert(at);
        times.push(duration_seconds(at - start));
        values.push(v);
    }
    if skipped > 0 {
        debug!("skipped {} malformed rows in {}", skipped, path.display());
    }

    let mut data = DataSet::new();
    data.insert_field("time/s", Array1::from_vec(times))?;
    data.insert_field("CO2/%", Array1::from_vec(values))?;
    data.set_time_field("time/s")?;
    if let Some(start) = start_time {
        data.set_start_time(start);
    }
    data.set_alias("t", "time/s");
    data.set_alias("CO2", "CO2/%");
    Ok(data)
}

/// Short aliases for the columns an ECLab export usually carries. Absent
/// columns simply get no alias.
pub fn install_standard_aliases(data: &mut DataSet) {
    data.set_alias("t", "time/s");
    data.set_alias("E", "Ewe/V");
    data.set_alias("I", "I/mA");
    data.set_alias("c", "cycle number");
    data.set_alias("P", "Pressure/bar (on Analog In1)");
}

/// Rows belonging to one instrument-numbered cycle (`cycle number` column).
pub fn cycle_slice(data: &DataSet, cycle: f64) -> Result<DataSet, GcdError> {
    data.in_range("c", cycle, cycle)
}

/// Rows of several instrument-numbered cycles, concatenated in the order
/// given. Cycle numbers wrap modulo the maximum so `-1` reaches backwards
/// from the end.
pub fn cycles_slice(data: &DataSet, cycles: &[f64]) -> Result<DataSet, GcdError> {
    if cycles.is_empty() {
        return Err(GcdError::InvalidParameter(
            "no cycle numbers provided".to_string(),
        ));
    }
    let column = data.field("c")?;
    let max = column.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut combined: Option<DataSet> = None;
    for &cycle in cycles {
        let wrapped = if max > 0.0 { cycle.rem_euclid(max) } else { cycle };
        let slice = cycle_slice(data, wrapped)?;
        combined = Some(match combined {
            None => slice,
            Some(acc) => acc.combine(&slice)?,
        });
    }
    combined.ok_or(GcdError::InsufficientData)
}

fn record_row(
    columns: &mut [Vec<f64>],
    cells: &[&str],
    time_index: Option<usize>,
    dates: bool,
    start_time: Option<DateTime<Utc>>,
) -> Result<(), GcdError> {
    for (index, column) in columns.iter_mut().enumerate() {
        let cell = cells.get(index).copied().unwrap_or("");
        let value = if dates && Some(index) == time_index {
            let at = parse_datetime(cell, ECLAB_TIME_FORMAT).ok_or_else(|| {
                GcdError::EcLabParse(format!("bad timestamp '{}'", cell.trim()))
            })?;
            match start_time {
                Some(start) => duration_seconds(at - start),
                None => 0.0,
            }
        } else {
            parse_cell(cell)?
        };
        column.push(value);
    }
    Ok(())
}

/// Numeric cell: blank means NaN, comma decimal separators are accepted.
fn parse_cell(cell: &str) -> Result<f64, GcdError> {
    let cleaned = cell.trim().replace(',', ".");
    if cleaned.is_empty() {
        return Ok(f64::NAN);
    }
    cleaned
        .parse()
        .map_err(|_| GcdError::EcLabParse(format!("unparseable value '{}'", cell.trim())))
}

fn clean_column_name(raw: &str) -> String {
    raw.replace('µ', "u")
        .replace('<', "")
        .replace('>', "")
        .replace('"', "")
        .trim_end()
        .to_string()
}

fn parse_datetime(text: &str, format: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text.trim(), format)
        .ok()
        .map(|naive| naive.and_utc())
}

/// ECLab CSV stamps vary in fractional-second width; widen to microseconds.
fn pad_fractional_seconds(stamp: &str) -> String {
    match stamp.split_once('.') {
        Some((date, frac)) => format!("{}.{:0<6}", date, frac.trim()),
        None => stamp.to_string(),
    }
}

/// The first line is encoded latin1 (micro signs in the units row), so the
/// whole file is decoded byte-for-byte.
fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use std::fs;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn txt_with_elapsed_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "run.txt",
            "mode\ttime/s\tEwe/V\t<I>/mA\t\n\
             1\t0.0\t0.20\t1.0\t\n\
             1\t1.0\t0.21\t1.0\t\n\
             1\t2.0\t0.22\t1.0\t\n",
        );
        let data = read_eclab(&path).unwrap();
        assert_eq!(data.len(), 3);
        // angle brackets are stripped from column names
        assert_eq!(data.field("I/mA").unwrap().to_vec(), vec![1.0, 1.0, 1.0]);
        assert_eq!(data.field("t").unwrap().to_vec(), vec![0.0, 1.0, 2.0]);
        assert_eq!(data.field("E").unwrap()[1], 0.21);
        assert!(data.start_time().is_none());
    }

    #[test]
    fn txt_with_absolute_dates() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "run.txt",
            "time/s\tEwe/V\tI/mA\t\n\
             01/15/2024 10:00:00.000000\t0.20\t1.0\t\n\
             01/15/2024 10:00:01.500000\t0.21\t1.0\t\n\
             01/15/2024 10:00:03.000000\t0.22\t1.0\t\n",
        );
        let data = read_eclab_txt(&path).unwrap();
        assert_eq!(data.field("t").unwrap().to_vec(), vec![0.0, 1.5, 3.0]);
        let start = data.start_time().unwrap();
        assert_eq!(start.hour(), 10);
        assert_eq!(data.duration_s().unwrap(), 3.0);
    }

    #[test]
    fn txt_blank_cells_become_nan() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "run.txt",
            "time/s\tEwe/V\tI/mA\t\n\
             0.0\t\t1.0\t\n\
             1.0\t0.21\t1.0\t\n",
        );
        let data = read_eclab_txt(&path).unwrap();
        assert!(data.field("Ewe/V").unwrap()[0].is_nan());
        assert_eq!(data.field("Ewe/V").unwrap()[1], 0.21);
    }

    #[test]
    fn csv_start_stamp_and_zeroed_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "run.csv",
            "\"Technique started on : \";03/21/2025 04:33:06.786\n\
             \"time/s\";\"Ewe/V\";\"I/mA\"\n\
             100.0;0.20;1.0\n\
             101.0;0.21;1.0\n",
        );
        let data = read_eclab_csv(&path).unwrap();
        assert_eq!(data.field("t").unwrap().to_vec(), vec![0.0, 1.0]);
        let start = data.start_time().unwrap();
        assert_eq!(start.hour(), 4);
        assert_eq!(start.minute(), 33);
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "run.mpr", "binary");
        assert!(matches!(
            read_eclab(&path),
            Err(GcdError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn co2_reader_skips_malformed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "co2.txt",
            "2024-01-15 10:00:00.000,0.50\n\
             not a row\n\
             2024-01-15 10:00:02.000,0.52\n",
        );
        let data = read_co2_txt(&path).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.field("t").unwrap().to_vec(), vec![0.0, 2.0]);
        assert_eq!(data.field("CO2").unwrap().to_vec(), vec![0.50, 0.52]);
        assert!(data.start_time().is_some());
    }

    #[test]
    fn cycle_selection_wraps_backwards() {
        let mut data = DataSet::new();
        data.insert_field(
            "cycle number",
            Array1::from_vec(vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0]),
        )
        .unwrap();
        data.insert_field(
            "Ewe/V",
            Array1::from_vec(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]),
        )
        .unwrap();
        data.set_alias("c", "cycle number");

        let second = cycle_slice(&data, 2.0).unwrap();
        assert_eq!(second.field("Ewe/V").unwrap().to_vec(), vec![0.3, 0.4]);

        // -1 wraps modulo the maximum cycle number
        let wrapped = cycles_slice(&data, &[-1.0]).unwrap();
        assert_eq!(wrapped.field("c").unwrap().to_vec(), vec![2.0, 2.0]);

        let pair = cycles_slice(&data, &[1.0, 2.0]).unwrap();
        assert_eq!(pair.len(), 4);
        assert_eq!(
            pair.field("Ewe/V").unwrap().to_vec(),
            vec![0.1, 0.2, 0.3, 0.4]
        );

        assert!(matches!(
            cycles_slice(&data, &[]),
            Err(GcdError::InvalidParameter(_))
        ));
    }
}
