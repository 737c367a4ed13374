//! Explicitly owned metric registry.
//!
//! Instruments are defined by name at most once; asking for a name that
//! already exists hands back the same instrument, so lazily discovered
//! instruments can be requested every cycle without duplicate registration.
//! Reads (`gather`, `encode_text`) may happen concurrently with writes from
//! the collector; each instrument update is atomic on its own.

use std::collections::HashMap;

use parking_lot::RwLock;
use prometheus::{Counter, CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("instrument {name} already defined as {found}, requested {requested}")]
    KindMismatch {
        name: String,
        found: &'static str,
        requested: &'static str,
    },
    #[error("instrument {name} already defined with labels {found:?}, requested {requested:?}")]
    LabelMismatch {
        name: String,
        found: Vec<String>,
        requested: Vec<String>,
    },
    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
}

/// A defined instrument. Handles are cheap clones sharing the same value.
#[derive(Clone, Debug)]
pub enum Instrument {
    Gauge(Gauge),
    Counter(Counter),
    GaugeFamily { family: GaugeVec, labels: Vec<String> },
    CounterFamily { family: CounterVec, labels: Vec<String> },
}

impl Instrument {
    pub fn kind(&self) -> &'static str {
        match self {
            Instrument::Gauge(_) => "gauge",
            Instrument::Counter(_) => "counter",
            Instrument::GaugeFamily { .. } => "labeled gauge",
            Instrument::CounterFamily { .. } => "labeled counter",
        }
    }
}

pub struct MetricRegistry {
    registry: Registry,
    instruments: RwLock<HashMap<String, Instrument>>,
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self { registry: Registry::new(), instruments: RwLock::new(HashMap::new()) }
    }

    pub fn define_gauge(&self, name: &str, help: &str) -> Result<Gauge, RegistryError> {
        match self.get_or_define(name, "gauge", || Ok(Instrument::Gauge(Gauge::with_opts(Opts::new(name, help))?)))? {
            Instrument::Gauge(g) => Ok(g),
            other => Err(mismatch(name, &other, "gauge")),
        }
    }

    pub fn define_counter(&self, name: &str, help: &str) -> Result<Counter, RegistryError> {
        match self.get_or_define(name, "counter", || Ok(Instrument::Counter(Counter::with_opts(Opts::new(name, help))?)))? {
            Instrument::Counter(c) => Ok(c),
            other => Err(mismatch(name, &other, "counter")),
        }
    }

    pub fn define_labeled_gauge(&self, name: &str, help: &str, labels: &[&str]) -> Result<GaugeVec, RegistryError> {
        let inst = self.get_or_define(name, "labeled gauge", || {
            Ok(Instrument::GaugeFamily {
                family: GaugeVec::new(Opts::new(name, help), labels)?,
                labels: owned(labels),
            })
        })?;
        match inst {
            Instrument::GaugeFamily { family, labels: found } => {
                check_labels(name, found, labels)?;
                Ok(family)
            }
            other => Err(mismatch(name, &other, "labeled gauge")),
        }
    }

    pub fn define_labeled_counter(&self, name: &str, help: &str, labels: &[&str]) -> Result<CounterVec, RegistryError> {
        let inst = self.get_or_define(name, "labeled counter", || {
            Ok(Instrument::CounterFamily {
                family: CounterVec::new(Opts::new(name, help), labels)?,
                labels: owned(labels),
            })
        })?;
        match inst {
            Instrument::CounterFamily { family, labels: found } => {
                check_labels(name, found, labels)?;
                Ok(family)
            }
            other => Err(mismatch(name, &other, "labeled counter")),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.instruments.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.instruments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Render every instrument in the prometheus text exposition format.
    pub fn encode_text(&self) -> Result<Vec<u8>, RegistryError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.gather(), &mut buf)?;
        Ok(buf)
    }

    fn get_or_define<F>(&self, name: &str, requested: &'static str, make: F) -> Result<Instrument, RegistryError>
    where
        F: FnOnce() -> Result<Instrument, RegistryError>,
    {
        if let Some(existing) = self.instruments.read().get(name) {
            return Ok(existing.clone());
        }
        let mut instruments = self.instruments.write();
        // another writer may have won the race between the two locks
        if let Some(existing) = instruments.get(name) {
            return Ok(existing.clone());
        }
        let inst = make()?;
        match &inst {
            Instrument::Gauge(g) => self.registry.register(Box::new(g.clone()))?,
            Instrument::Counter(c) => self.registry.register(Box::new(c.clone()))?,
            Instrument::GaugeFamily { family, .. } => self.registry.register(Box::new(family.clone()))?,
            Instrument::CounterFamily { family, .. } => self.registry.register(Box::new(family.clone()))?,
        }
        debug!(instrument = name, kind = requested, "instrument defined");
        instruments.insert(name.to_string(), inst.clone());
        Ok(inst)
    }
}

fn owned(labels: &[&str]) -> Vec<String> {
    labels.iter().map(|l| l.to_string()).collect()
}

fn check_labels(name: &str, found: Vec<String>, requested: &[&str]) -> Result<(), RegistryError> {
    if found.iter().map(String::as_str).eq(requested.iter().copied()) {
        Ok(())
    } else {
        Err(RegistryError::LabelMismatch { name: name.to_string(), found, requested: owned(requested) })
    }
}

fn mismatch(name: &str, found: &Instrument, requested: &'static str) -> RegistryError {
    RegistryError::KindMismatch { name: name.to_string(), found: found.kind(), requested }
}
