//! Radio link seam.
//!
//! The tree protocol needs exactly two things from the link: a fire-and-forget
//! broadcast send, and a stream of received frames tagged with the sender's
//! link address and signal strength. Delivery outcomes come back through a
//! send-completion callback that has no link to the frame that caused them.
use log::{debug, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::logutil::{format_mac, hex_preview};
use crate::tree::frame::MAX_FRAME_LEN;

/// Called once per send with the delivery result.
pub type SendCallback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RadioError {
    #[error("radio link closed")]
    Closed,
    #[error("frame of {0} bytes exceeds the link limit")]
    TooLarge(usize),
}

/// One frame heard on the air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxEvent {
    pub bytes: Vec<u8>,
    pub sender: [u8; 6],
    pub rssi: i32,
}

pub trait Radio: Send {
    /// This station's link address.
    fn address(&self) -> [u8; 6];

    /// Queue `frame` for broadcast. `Ok` only means the frame was accepted.
    fn send_broadcast(&mut self, frame: &[u8]) -> Result<(), RadioError>;

    fn on_send_complete(&mut self, callback: SendCallback);
}

/// Link address used for a simulated station with the given HID.
pub fn station_address(hid: u16) -> [u8; 6] {
    let [hi, lo] = hid.to_be_bytes();
    [0x02, 0x54, 0x52, 0x00, hi, lo]
}

/// Keeps every sent frame and completes each send immediately.
#[derive(Clone, Default)]
pub struct RecordingRadio {
    address: [u8; 6],
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    callback: Option<SendCallback>,
    fail: bool,
}

impl RecordingRadio {
    pub fn new(address: [u8; 6]) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    /// A radio whose sends are accepted but always complete as failed.
    pub fn failing(address: [u8; 6]) -> Self {
        Self {
            address,
            fail: true,
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .map(|mut v| std::mem::take(&mut *v))
            .unwrap_or_default()
    }
}

impl Radio for RecordingRadio {
    fn address(&self) -> [u8; 6] {
        self.address
    }

    fn send_broadcast(&mut self, frame: &[u8]) -> Result<(), RadioError> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(RadioError::TooLarge(frame.len()));
        }
        if !self.fail {
            self.sent
                .lock()
                .map_err(|_| RadioError::Closed)?
                .push(frame.to_vec());
        }
        if let Some(cb) = &self.callback {
            cb(!self.fail);
        }
        Ok(())
    }

    fn on_send_complete(&mut self, callback: SendCallback) {
        self.callback = Some(callback);
    }
}

#[derive(Debug, Clone)]
pub struct AirSettings {
    /// Probability that a given listener misses a frame.
    pub loss: f64,
    pub rssi_range: (i32, i32),
    pub seed: u64,
}

impl Default for AirSettings {
    fn default() -> Self {
        Self {
            loss: 0.0,
            rssi_range: (-90, -40),
            seed: 0x7EE5,
        }
    }
}

struct AirPacket {
    from: [u8; 6],
    bytes: Vec<u8>,
    done: Option<SendCallback>,
}

struct Station {
    address: [u8; 6],
    rx: mpsc::UnboundedSender<RxEvent>,
}

/// In-process broadcast medium: every frame reaches every other attached
/// station, subject to the configured loss.
#[derive(Clone)]
pub struct SimulatedAir {
    tx: mpsc::UnboundedSender<AirPacket>,
    stations: Arc<Mutex<Vec<Station>>>,
}

impl SimulatedAir {
    /// Start the medium on the current tokio runtime.
    pub fn spawn(settings: AirSettings) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AirPacket>();
        let stations: Arc<Mutex<Vec<Station>>> = Arc::new(Mutex::new(Vec::new()));
        let listeners = stations.clone();
        tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(settings.seed);
            let (lo, hi) = settings.rssi_range;
            while let Some(packet) = rx.recv().await {
                trace!(
                    "air: {} bytes from {}: {}",
                    packet.bytes.len(),
                    format_mac(&packet.from),
                    hex_preview(&packet.bytes)
                );
                let delivered = match listeners.lock() {
                    Ok(list) => {
                        for station in list.iter().filter(|s| s.address != packet.from) {
                            if settings.loss > 0.0 && rng.gen_bool(settings.loss.min(1.0)) {
                                debug!("air: frame lost before {}", format_mac(&station.address));
                                continue;
                            }
                            let _ = station.rx.send(RxEvent {
                                bytes: packet.bytes.clone(),
                                sender: packet.from,
                                rssi: rng.gen_range(lo.min(hi)..=hi.max(lo)),
                            });
                        }
                        true
                    }
                    Err(_) => {
                        warn!("air: station list poisoned, frame dropped");
                        false
                    }
                };
                if let Some(done) = packet.done {
                    done(delivered);
                }
            }
            debug!("air: all radios gone, medium stopped");
        });
        Self { tx, stations }
    }

    /// Register a station and return its radio and receive queue.
    pub fn attach(&self, address: [u8; 6]) -> (SimRadio, mpsc::UnboundedReceiver<RxEvent>) {
        let (rx_tx, rx) = mpsc::unbounded_channel();
        match self.stations.lock() {
            Ok(mut list) => list.push(Station {
                address,
                rx: rx_tx,
            }),
            Err(_) => warn!("air: cannot attach {}, station list poisoned", format_mac(&address)),
        }
        let radio = SimRadio {
            address,
            air: self.tx.clone(),
            callback: None,
        };
        (radio, rx)
    }
}

pub struct SimRadio {
    address: [u8; 6],
    air: mpsc::UnboundedSender<AirPacket>,
    callback: Option<SendCallback>,
}

impl Radio for SimRadio {
    fn address(&self) -> [u8; 6] {
        self.address
    }

    fn send_broadcast(&mut self, frame: &[u8]) -> Result<(), RadioError> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(RadioError::TooLarge(frame.len()));
        }
        self.air
            .send(AirPacket {
                from: self.address,
                bytes: frame.to_vec(),
                done: self.callback.clone(),
            })
            .map_err(|_| RadioError::Closed)
    }

    fn on_send_complete(&mut self, callback: SendCallback) {
        self.callback = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn recording_radio_keeps_frames_and_reports() {
        let mut radio = RecordingRadio::new(station_address(12));
        let ok = Arc::new(AtomicUsize::new(0));
        let counter = ok.clone();
        radio.on_send_complete(Arc::new(move |success| {
            if success {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }));
        radio.send_broadcast(&[1, 2, 3]).unwrap();
        assert_eq!(radio.sent(), vec![vec![1, 2, 3]]);
        assert_eq!(ok.load(Ordering::Relaxed), 1);
        assert_eq!(
            radio.send_broadcast(&[0; 300]),
            Err(RadioError::TooLarge(300))
        );
        assert_eq!(radio.take_sent().len(), 1);
        assert!(radio.sent().is_empty());
    }

    #[tokio::test]
    async fn air_delivers_to_everyone_but_sender() {
        let air = SimulatedAir::spawn(AirSettings::default());
        let (mut a, mut a_rx) = air.attach(station_address(1));
        let (_b, mut b_rx) = air.attach(station_address(12));
        let (_c, mut c_rx) = air.attach(station_address(13));

        a.send_broadcast(&[0xAA, 0x55]).unwrap();
        for rx in [&mut b_rx, &mut c_rx] {
            let ev = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("delivery timed out")
                .expect("air closed");
            assert_eq!(ev.bytes, vec![0xAA, 0x55]);
            assert_eq!(ev.sender, station_address(1));
            assert!((-90..=-40).contains(&ev.rssi));
        }
        assert!(a_rx.try_recv().is_err());
    }
}
