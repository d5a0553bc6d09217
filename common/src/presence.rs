use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::peripherals::PresenceSensor;

/// Which raw pin level means "someone is there".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    ActiveHigh,
    ActiveLow,
}

impl Polarity {
    pub fn is_present(self, raw_high: bool) -> bool {
        match self {
            Self::ActiveHigh => raw_high,
            Self::ActiveLow => !raw_high,
        }
    }

    /// Pin level a sensor with this polarity shows for `present`.
    pub fn raw_level(self, present: bool) -> bool {
        match self {
            Self::ActiveHigh => present,
            Self::ActiveLow => !present,
        }
    }
}

pub trait DigitalInput: Send {
    fn is_high(&self) -> bool;
}

/// Level-read obstacle sensor. No debounce; the level is sampled on demand.
#[derive(Debug)]
pub struct ProximitySensor<I> {
    input: I,
    polarity: Polarity,
}

impl<I: DigitalInput> ProximitySensor<I> {
    pub fn new(input: I, polarity: Polarity) -> Self {
        Self { input, polarity }
    }
}

impl<I: DigitalInput> PresenceSensor for ProximitySensor<I> {
    fn read_presence(&self) -> bool {
        self.polarity.is_present(self.input.is_high())
    }
}

/// Debounced presence transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceEdge {
    pub present: bool,
}

/// Filters raw pin edges from a motion sensor.
///
/// An edge counts only if the pin still reads the same level once the
/// debounce delay has passed, the sensor's warm-up is over, and the level
/// differs from the last accepted one.
///
/// Edges during warm-up are dropped, so the level is read straight from the
/// pin once warm-up ends (`resync`). A sensor already holding its output when
/// the controller boots is seen without waiting for another edge.
#[derive(Debug, Clone)]
pub struct MotionDebouncer {
    polarity: Polarity,
    debounce: Duration,
    ready_at: Instant,
    present: bool,
    synced: bool,
}

impl MotionDebouncer {
    pub fn new(polarity: Polarity, debounce: Duration, warmup: Duration, started: Instant) -> Self {
        Self {
            polarity,
            debounce,
            ready_at: started + warmup,
            present: false,
            synced: false,
        }
    }

    pub fn ready_at(&self) -> Instant {
        self.ready_at
    }

    /// True until a settled level has been taken after warm-up.
    pub fn needs_resync(&self) -> bool {
        !self.synced
    }

    /// Adopts the pin level as-is. Does nothing before warm-up ends.
    pub fn resync(&mut self, raw: bool, now: Instant) -> Option<PresenceEdge> {
        if now < self.ready_at {
            return None;
        }
        self.synced = true;
        debug!("presence: level resynced from pin");
        self.accept(self.polarity.is_present(raw))
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub fn present(&self) -> bool {
        self.present
    }

    pub fn on_edge(&mut self, raw_at_edge: bool, raw_settled: bool, now: Instant) -> Option<PresenceEdge> {
        if now < self.ready_at {
            debug!("presence: edge ignored during warm-up");
            return None;
        }
        if raw_at_edge != raw_settled {
            debug!("presence: bounce discarded");
            return None;
        }

        self.synced = true;
        self.accept(self.polarity.is_present(raw_settled))
    }

    fn accept(&mut self, present: bool) -> Option<PresenceEdge> {
        if present == self.present {
            return None;
        }
        self.present = present;
        info!("presence: {}", if present { "detected" } else { "cleared" });
        Some(PresenceEdge { present })
    }
}

/// Latest debounced motion level. Clones share the level.
#[derive(Debug, Clone, Default)]
pub struct MotionSensor {
    level: Arc<AtomicBool>,
}

impl MotionSensor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, edge: PresenceEdge) {
        self.level.store(edge.present, Ordering::Relaxed);
    }
}

impl PresenceSensor for MotionSensor {
    fn read_presence(&self) -> bool {
        self.level.load(Ordering::Relaxed)
    }
}

/// Consumes raw edges (the pin level captured when the edge fired), waits
/// out the debounce delay, re-reads the pin, and forwards accepted
/// transitions. Until the first settled reading it also wakes at the end of
/// warm-up to take the level from the pin. Ends when the raw edge sender is
/// dropped.
pub fn spawn_debounce_worker<I>(
    input: I,
    raw_edges: Receiver<bool>,
    mut debouncer: MotionDebouncer,
    sensor: MotionSensor,
    edges: Option<Sender<PresenceEdge>>,
) -> std::io::Result<JoinHandle<()>>
where
    I: DigitalInput + 'static,
{
    thread::Builder::new()
        .name("presence-debounce".to_string())
        .spawn(move || {
            let publish = |edge: Option<PresenceEdge>| {
                if let Some(edge) = edge {
                    sensor.apply(edge);
                    if let Some(edges) = &edges {
                        // Nobody listening is fine; the level is still kept.
                        let _ = edges.send(edge);
                    }
                }
            };

            loop {
                let next = if debouncer.needs_resync() {
                    let wait = debouncer.ready_at().saturating_duration_since(Instant::now());
                    raw_edges.recv_timeout(wait)
                } else {
                    raw_edges.recv().map_err(|_| RecvTimeoutError::Disconnected)
                };

                let raw_at_edge = match next {
                    Ok(raw) => raw,
                    Err(RecvTimeoutError::Timeout) => {
                        publish(debouncer.resync(input.is_high(), Instant::now()));
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                };

                thread::sleep(debouncer.debounce());
                let settled = input.is_high();
                publish(debouncer.on_edge(raw_at_edge, settled, Instant::now()));
            }
            debug!("presence: raw edge source closed, debounce worker done");
        })
}

/// Presence source chosen by configuration.
#[derive(Debug)]
pub enum PresenceInput<I> {
    Motion(MotionSensor),
    Proximity(ProximitySensor<I>),
}

impl<I: DigitalInput> PresenceSensor for PresenceInput<I> {
    fn read_presence(&self) -> bool {
        match self {
            Self::Motion(sensor) => sensor.read_presence(),
            Self::Proximity(sensor) => sensor.read_presence(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[derive(Clone, Default)]
    struct FakePin(Arc<AtomicBool>);

    impl FakePin {
        fn set(&self, high: bool) {
            self.0.store(high, Ordering::SeqCst);
        }
    }

    impl DigitalInput for FakePin {
        fn is_high(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn debouncer(started: Instant) -> MotionDebouncer {
        MotionDebouncer::new(
            Polarity::ActiveLow,
            Duration::from_millis(50),
            Duration::from_secs(2),
            started,
        )
    }

    #[test]
    fn proximity_is_active_low() {
        let pin = FakePin::default();
        let sensor = ProximitySensor::new(pin.clone(), Polarity::ActiveLow);

        assert!(sensor.read_presence());
        pin.set(true);
        assert!(!sensor.read_presence());
    }

    #[test]
    fn warm_up_edges_are_ignored() {
        let start = Instant::now();
        let mut filter = debouncer(start);

        assert_eq!(filter.on_edge(false, false, start + Duration::from_secs(1)), None);
        assert_eq!(
            filter.on_edge(false, false, start + Duration::from_secs(3)),
            Some(PresenceEdge { present: true })
        );
    }

    #[test]
    fn bounces_and_repeats_are_dropped() {
        let start = Instant::now();
        let mut filter = debouncer(start);
        let later = start + Duration::from_secs(5);

        assert_eq!(filter.on_edge(false, true, later), None);
        assert_eq!(filter.on_edge(false, false, later), Some(PresenceEdge { present: true }));
        assert_eq!(filter.on_edge(false, false, later), None);
        assert_eq!(filter.on_edge(true, true, later), Some(PresenceEdge { present: false }));
        assert!(!filter.present());
    }

    #[test]
    fn resync_waits_for_warm_up_then_takes_pin_level() {
        let start = Instant::now();
        let mut filter = debouncer(start);

        assert_eq!(filter.resync(false, start + Duration::from_secs(1)), None);
        assert!(filter.needs_resync());

        assert_eq!(
            filter.resync(false, start + Duration::from_secs(2)),
            Some(PresenceEdge { present: true })
        );
        assert!(!filter.needs_resync());
        assert!(filter.present());
    }

    #[test]
    fn accepted_edge_counts_as_synced() {
        let start = Instant::now();
        let mut filter = debouncer(start);
        let later = start + Duration::from_secs(3);

        filter.on_edge(false, true, later);
        assert!(filter.needs_resync());

        filter.on_edge(true, true, later);
        assert!(!filter.needs_resync());
        assert!(!filter.present());
    }

    fn worker(
        pin: &FakePin,
        warmup: Duration,
    ) -> (mpsc::Sender<bool>, mpsc::Receiver<PresenceEdge>, MotionSensor, JoinHandle<()>) {
        let sensor = MotionSensor::new();
        let (raw_tx, raw_rx) = mpsc::channel();
        let (edge_tx, edge_rx) = mpsc::channel();
        let filter =
            MotionDebouncer::new(Polarity::ActiveLow, Duration::from_millis(1), warmup, Instant::now());
        let handle =
            spawn_debounce_worker(pin.clone(), raw_rx, filter, sensor.clone(), Some(edge_tx))
                .unwrap();
        (raw_tx, edge_rx, sensor, handle)
    }

    #[test]
    fn worker_publishes_level_and_edges() {
        let pin = FakePin::default();
        pin.set(true);
        let (raw_tx, edge_rx, sensor, handle) = worker(&pin, Duration::ZERO);

        pin.set(false);
        raw_tx.send(false).unwrap();
        assert_eq!(
            edge_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            PresenceEdge { present: true }
        );
        assert!(sensor.read_presence());

        pin.set(true);
        raw_tx.send(true).unwrap();
        assert_eq!(
            edge_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            PresenceEdge { present: false }
        );
        assert!(!sensor.read_presence());

        drop(raw_tx);
        handle.join().unwrap();
    }

    #[test]
    fn sensor_active_at_boot_is_seen_without_an_edge() {
        let pin = FakePin::default();
        let (raw_tx, edge_rx, sensor, handle) = worker(&pin, Duration::ZERO);

        assert_eq!(
            edge_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            PresenceEdge { present: true }
        );
        assert!(sensor.read_presence());

        drop(raw_tx);
        handle.join().unwrap();
    }

    #[test]
    fn level_held_through_warm_up_is_picked_up_when_it_ends() {
        let warmup = Duration::from_millis(150);
        let started = Instant::now();
        let pin = FakePin::default();
        let (raw_tx, edge_rx, sensor, handle) = worker(&pin, warmup);

        // Arrives during warm-up and is dropped by the filter.
        raw_tx.send(false).unwrap();

        assert_eq!(
            edge_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            PresenceEdge { present: true }
        );
        assert!(started.elapsed() >= warmup);
        assert!(sensor.read_presence());

        drop(raw_tx);
        handle.join().unwrap();
    }

    #[test]
    fn configured_variant_dispatches() {
        let motion: PresenceInput<FakePin> = PresenceInput::Motion(MotionSensor::new());
        assert!(!motion.read_presence());

        let pin = FakePin::default();
        pin.set(true);
        let proximity = PresenceInput::Proximity(ProximitySensor::new(pin, Polarity::ActiveHigh));
        assert!(proximity.read_presence());
    }
}
