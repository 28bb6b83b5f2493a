//! Assembly of half-cycle and voltage-hold regions into charge-discharge
//! cycles.
//!
//! The assembler walks the merged region stream in start-index order through a
//! small state machine: a cycle opens on a charging region, may accumulate
//! holds, records one discharging region, and is emitted when the next
//! charging region arrives (or at end of input). Malformed sequences are never
//! fatal: the offending region is discarded and counted in the
//! [`AssemblySummary`].

use serde::{Deserialize, Serialize};

use crate::regions::{Direction, HalfCycleRegion, Region, VoltageHoldRegion};

/// One complete charge -> (hold) -> discharge cycle. `regions` is
/// chronological and contains exactly one charging and one discharging
/// half-cycle; holds may appear anywhere after the charging step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cycle {
    pub regions: Vec<Region>,
    pub charging: HalfCycleRegion,
    pub discharging: HalfCycleRegion,
}

impl Cycle {
    /// First sample index covered by the cycle.
    pub fn start_index(&self) -> usize {
        self.regions
            .first()
            .map(|r| r.start_index())
            .unwrap_or(self.charging.start)
    }

    /// Last sample index covered by the cycle.
    pub fn end_index(&self) -> usize {
        self.regions
            .last()
            .map(|r| r.end_index())
            .unwrap_or(self.discharging.end)
    }
}

/// Counts reported by [`assemble_cycles`]. Informational only; anomalous
/// regions are counted both under their anomaly and as unused.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblySummary {
    pub cycles_emitted: usize,
    pub unused_charging: usize,
    pub unused_discharging: usize,
    pub unused_holds: usize,
    pub multiple_charging_steps: usize,
    pub multiple_discharging_steps: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleAssembly {
    pub cycles: Vec<Cycle>,
    pub summary: AssemblySummary,
}

/// Merge half-cycle and hold regions, sorted by start index, into complete
/// cycles.
///
/// Rules per region kind:
/// - charging: opens a cycle; a second charging region before any discharge is
///   a multiple-charging-steps anomaly and is discarded; after a discharge it
///   completes the in-progress cycle and opens the next one;
/// - discharging: discarded when no cycle is open; recorded once; a second one
///   is a multiple-discharging-steps anomaly;
/// - hold: appended to the open cycle, discarded otherwise.
///
/// A trailing charging-only cycle is dropped, its regions counted as unused.
pub fn assemble_cycles(
    half_cycles: &[HalfCycleRegion],
    holds: &[VoltageHoldRegion],
) -> CycleAssembly {
    let mut stream: Vec<Region> = half_cycles
        .iter()
        .copied()
        .map(Region::HalfCycle)
        .chain(holds.iter().copied().map(Region::VoltageHold))
        .collect();
    stream.sort_by_key(|r| r.start_index());

    let mut summary = AssemblySummary::default();
    let mut cycles = Vec::new();
    let mut regions: Vec<Region> = Vec::new();
    let mut charging: Option<HalfCycleRegion> = None;
    let mut discharging: Option<HalfCycleRegion> = None;

    for region in stream {
        match region {
            Region::HalfCycle(half) if half.direction == Direction::Charging => {
                match (charging, discharging) {
                    (None, _) => {
                        charging = Some(half);
                        regions.push(region);
                    }
                    (Some(_), None) => {
                        summary.multiple_charging_steps += 1;
                        summary.unused_charging += 1;
                    }
                    (Some(c), Some(d)) => {
                        cycles.push(Cycle {
                            regions: std::mem::take(&mut regions),
                            charging: c,
                            discharging: d,
                        });
                        charging = Some(half);
                        discharging = None;
                        regions.push(region);
                    }
                }
            }
            Region::HalfCycle(half) => match (charging, discharging) {
                (None, _) => summary.unused_discharging += 1,
                (Some(_), None) => {
                    discharging = Some(half);
                    regions.push(region);
                }
                (Some(_), Some(_)) => {
                    summary.multiple_discharging_steps += 1;
                    summary.unused_discharging += 1;
                }
            },
            Region::VoltageHold(_) => {
                if charging.is_some() {
                    regions.push(region);
                } else {
                    summary.unused_holds += 1;
                }
            }
            // current regions never enter the assembly stream
            Region::Current(_) => {}
        }
    }

    if let (Some(c), Some(d)) = (charging, discharging) {
        cycles.push(Cycle {
            regions,
            charging: c,
            discharging: d,
        });
    } else {
        for region in &regions {
            match region {
                Region::HalfCycle(h) if h.direction == Direction::Charging => {
                    summary.unused_charging += 1
                }
                Region::VoltageHold(_) => summary.unused_holds += 1,
                _ => {}
            }
        }
    }

    summary.cycles_emitted = cycles.len();
    CycleAssembly { cycles, summary }
}
