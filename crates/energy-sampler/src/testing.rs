//! Test double for code that drives an [`EnergySampler`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Domain, EnergyReading, EnergySampler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerEvent {
    Started,
    Refused,
    Stopped,
}

/// Shared view of everything a [`ScriptedSampler`] was asked to do.
#[derive(Debug, Clone, Default)]
pub struct SamplerEvents(Arc<Mutex<Vec<SamplerEvent>>>);

impl SamplerEvents {
    pub fn snapshot(&self) -> Vec<SamplerEvent> {
        self.0.lock().clone()
    }

    pub fn count(&self, event: SamplerEvent) -> usize {
        self.0.lock().iter().filter(|e| **e == event).count()
    }

    fn push(&self, event: SamplerEvent) {
        self.0.lock().push(event);
    }
}

/// Sampler whose availability follows a script. Once the script runs out
/// every further `start` answers with the fallback.
#[derive(Debug)]
pub struct ScriptedSampler {
    script: VecDeque<bool>,
    fallback: bool,
    joules_per_bracket: f64,
    events: SamplerEvents,
}

impl ScriptedSampler {
    pub fn available() -> Self {
        Self::scripted([], true)
    }

    pub fn unavailable() -> Self {
        Self::scripted([], false)
    }

    pub fn scripted(script: impl IntoIterator<Item = bool>, fallback: bool) -> Self {
        Self {
            script: script.into_iter().collect(),
            fallback,
            joules_per_bracket: 1.0,
            events: SamplerEvents::default(),
        }
    }

    pub fn joules_per_bracket(mut self, joules: f64) -> Self {
        self.joules_per_bracket = joules;
        self
    }

    pub fn events(&self) -> SamplerEvents {
        self.events.clone()
    }
}

impl EnergySampler for ScriptedSampler {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn start(&mut self) -> bool {
        let available = self.script.pop_front().unwrap_or(self.fallback);
        self.events.push(if available {
            SamplerEvent::Started
        } else {
            SamplerEvent::Refused
        });
        available
    }

    fn stop(&mut self) -> EnergyReading {
        self.events.push(SamplerEvent::Stopped);
        let mut reading = EnergyReading::default();
        reading.set(Domain::Package, self.joules_per_bracket);
        reading
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_then_fallback() {
        let mut sampler = ScriptedSampler::scripted([true, false], true);
        let events = sampler.events();
        assert!(sampler.start());
        sampler.stop();
        assert!(!sampler.start());
        assert!(sampler.start());
        assert_eq!(events.count(SamplerEvent::Refused), 1);
        assert_eq!(events.count(SamplerEvent::Started), 2);
    }
}
