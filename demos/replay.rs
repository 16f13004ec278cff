use antsense::{
    ChannelState, FrameSink, MemoryPairingStore, MessageId, PairingStore, Reading, Result,
    SensorSnapshot, SensorType, Supervisor, SupervisorConfig,
};
use bytes::Bytes;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::mpsc, time::interval};
use tracing::{info, warn};

/// Device numbers the simulated sensors answer with
const HEART_RATE_DEVICE: u16 = 4711;
const CADENCE_DEVICE: u16 = 815;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📡 antsense replay example");
    info!("Simulating a heart rate strap and a cadence sensor, no speed sensor in range");

    let (sink, frames) = FrameSink::channel();
    let config = SupervisorConfig {
        search_timeout: Duration::from_secs(3),
        ..SupervisorConfig::default()
    };
    let pairing = Arc::new(MemoryPairingStore::new());
    let supervisor = Arc::new(Supervisor::new(config, sink, pairing.clone()));

    let mut updates = supervisor.subscribe();
    supervisor.start()?;

    let radio = tokio::spawn(simulate_radio(Arc::clone(&supervisor), frames));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(6);
    while let Ok(Ok(())) = tokio::time::timeout_at(deadline, updates.changed()).await {
        let snapshot = Arc::clone(&updates.borrow_and_update());
        print_snapshot(&snapshot);
    }

    supervisor.shutdown()?;
    radio.abort();

    info!(
        heart_rate = ?pairing.get(SensorType::HeartRate),
        cadence = ?pairing.get(SensorType::BikeCadence),
        "paired devices"
    );
    Ok(())
}

/// Plays the part of the ANT stick: acknowledges commands and broadcasts
/// sensor pages four times a second.
async fn simulate_radio(supervisor: Arc<Supervisor>, mut frames: mpsc::UnboundedReceiver<Bytes>) {
    let mut ticker = interval(Duration::from_millis(250));
    let mut tick: u16 = 0;
    let mut device_time: u16 = 0;
    let mut crank_time: u16 = 0;
    let mut revolutions: u16 = 0;

    loop {
        ticker.tick().await;

        while let Ok(frame) = frames.try_recv() {
            for reply in answer(&frame) {
                feed(&supervisor, &reply);
            }
        }

        tick = tick.wrapping_add(1);
        device_time = device_time.wrapping_add(256);
        // one crank revolution every 750 ms, 80 rpm
        if tick % 3 == 0 {
            revolutions = revolutions.wrapping_add(1);
            crank_time = device_time;
        }

        let bpm = 120 + u8::try_from(tick % 20).unwrap_or(0);
        feed(&supervisor, &broadcast(0, [0, 0, 0, 0, 0, 0, 0, bpm]));

        let [t0, t1] = crank_time.to_le_bytes();
        let [r0, r1] = revolutions.to_le_bytes();
        feed(&supervisor, &broadcast(1, [0, 0, 0, 0, t0, t1, r0, r1]));
    }
}

/// Replies the stick would send for one command frame
fn answer(frame: &[u8]) -> Vec<Vec<u8>> {
    let (Some(&id), Some(&channel)) = (frame.get(1), frame.get(2)) else {
        return Vec::new();
    };

    if id == MessageId::Request as u8 && frame.get(3) == Some(&(MessageId::ChannelId as u8)) {
        let (device_number, sensor) = match channel {
            0 => (HEART_RATE_DEVICE, SensorType::HeartRate),
            _ => (CADENCE_DEVICE, SensorType::BikeCadence),
        };
        let [lo, hi] = device_number.to_le_bytes();
        return vec![vec![5, 0x51, channel, lo, hi, sensor.device_type(), 1]];
    }

    let mut replies = vec![vec![3, 0x40, channel, id, 0]];
    if id == MessageId::CloseChannel as u8 {
        replies.push(vec![3, 0x40, channel, MessageId::Event as u8, 0x07]);
    }
    replies
}

fn broadcast(channel: u8, payload: [u8; 8]) -> Vec<u8> {
    let mut frame = vec![9, 0x4E, channel];
    frame.extend_from_slice(&payload);
    frame
}

fn feed(supervisor: &Supervisor, frame: &[u8]) {
    if let Err(e) = supervisor.feed(frame, Instant::now()) {
        warn!("⚠️ Dropped message: {}", e);
    }
}

fn print_snapshot(snapshot: &SensorSnapshot) {
    fn show<T: std::fmt::Display>(reading: Option<Reading<T>>, unit: &str) -> String {
        reading.map_or_else(|| "--".to_string(), |r| format!("{:.0} {unit}", r.value))
    }

    let states: Vec<String> = snapshot
        .channel_states
        .iter()
        .take(3)
        .map(ChannelState::to_string)
        .collect();

    println!(
        "#{:<3} ❤️ {:>8}  🚴 {:>8}  💨 {:>8}  [{}]",
        snapshot.version,
        show(snapshot.heart_rate, "bpm"),
        show(snapshot.cadence, "rpm"),
        show(snapshot.speed, "m/s"),
        states.join(", ")
    );
}
