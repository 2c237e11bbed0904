// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of computility.
//
// computility is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// computility is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with computility.  If not,
// see <http://www.gnu.org/licenses/>.

//! # computility metrics
//!
//! # Introduction
//!
//! computility exports its metrics through [OpenTelemetry]. OTel calls counters, gauges &
//! histograms "instruments" and asks that they be created once & re-used, which leaves the question
//! of where to keep them. Rather than a field per instrument on the application state, or a
//! centralized list of metric names, each module declares the metrics it uses next to the code that
//! uses them:
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! ```ignore
//! inventory::submit!(metrics::Registration::new("quota.consume.success", Sort::IntegralCounter));
//! // ...
//! async fn consume() {
//!     // ...
//!     counter_add!(state.instruments, "quota.consume.success", 1, &[]);
//! }
//! ```
//!
//! [inventory] gathers the registrations at link time; [Instruments::new] builds every registered
//! instrument up front (panicking on a name clash) & the macros below look them up by name.
//!
//! Looking up a name that wasn't registered, or using the wrong macro for an instrument's type,
//! panics. Those are logic errors, not runtime conditions, and [check_metric_registrations] is
//! called at startup so that a clash shows up immediately rather than on first use.

use std::collections::{HashMap, HashSet, hash_map::Entry};

use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Gauge, Histogram},
};

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// `Counter<u64>`
    IntegralCounter,
    /// `Gauge<u64>`
    IntegralGauge,
    /// `Histogram<u64>`
    IntegralHistogram,
}

/// The type of thing being inventoried
///
/// Register a metric by name & type using
///
/// ```ignore
/// inventory::submit!{metrics::Registration::new("quota.recall.enqueued", Sort::IntegralCounter)}
/// ```
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

/// Panic if two registrations share a name
pub fn check_metric_registrations() {
    let mut names: HashSet<&'static str> = HashSet::new();
    IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
        if !names.insert(reg.name()) {
            panic!("The metric name {} was registered twice", reg.name());
        }
    });
}

enum Instrument {
    CounterU64(Counter<u64>),
    GaugeU64(Gauge<u64>),
    HistogramU64(Histogram<u64>),
}

/// Container for OTel instruments
pub struct Instruments {
    meter: opentelemetry::metrics::Meter,
    map: HashMap<&'static str, Instrument>,
}

impl Instruments {
    pub fn new(prefix: &'static str) -> Instruments {
        let mut m: HashMap<&'static str, Instrument> = HashMap::new();
        let meter = global::meter(prefix);
        // Building everything up front means `add` & friends only need `&self`, so an instance can
        // live in an `Arc`.
        IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
            match m.entry(reg.name()) {
                Entry::Occupied(_) => {
                    panic!("The metric name {} was used twice", reg.name())
                }
                Entry::Vacant(vacant_entry) => {
                    vacant_entry.insert(match reg.sort() {
                        Sort::IntegralCounter => {
                            Instrument::CounterU64(meter.u64_counter(reg.name()).build())
                        }
                        Sort::IntegralGauge => {
                            Instrument::GaugeU64(meter.u64_gauge(reg.name()).build())
                        }
                        Sort::IntegralHistogram => {
                            Instrument::HistogramU64(meter.u64_histogram(reg.name()).build())
                        }
                    });
                }
            }
        });

        Instruments { meter, map: m }
    }
    pub fn meter(&self) -> &opentelemetry::metrics::Meter {
        &self.meter
    }
    // panics if `name` doesn't name a counter
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::CounterU64(c)) = self.map.get(name) {
            c.add(count, attributes);
        } else {
            panic!("{} does not name a counter", name);
        }
    }
    pub fn recordu(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::GaugeU64(g)) = self.map.get(name) {
            g.record(value, attributes);
        } else {
            panic!("{} does not name a gauge", name);
        }
    }
    pub fn observe(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::HistogramU64(h)) = self.map.get(name) {
            h.record(value, attributes);
        } else {
            panic!("{} does not name a histogram", name);
        }
    }
}

#[macro_export]
macro_rules! counter_add {
    ($instr:expr, $name:expr, $count:expr, $attrs:expr) => {
        $instr.add($name, $count, $attrs);
    };
}

#[macro_export]
macro_rules! gauge_setu {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.recordu($name, $value, $attrs);
    };
}

#[macro_export]
macro_rules! histogram_record {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.observe($name, $value, $attrs);
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registrations_are_unique() {
        check_metric_registrations();
        let instruments = Instruments::new("computility-test");
        // Every registered name should have been built
        for reg in inventory::iter::<Registration> {
            assert!(instruments.map.contains_key(reg.name()));
        }
    }
}
