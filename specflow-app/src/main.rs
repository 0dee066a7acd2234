//! specflow - streaming FFT/PSD demo
//!
//! Feeds a synthetic RF-tagged tone through the full pipeline and prints the
//! peak power bin as seen by a downstream consumer.

use std::f32::consts::PI;
use std::path::Path;
use std::thread;
use std::time::Duration;

use specflow_engine::{Settings, Supervisor};
use specflow_stream::{InFloatPort, Keyword, OutFloatPort, Sri, StreamPacket};

mod config;
use config::Config;

const SAMPLE_RATE: f64 = 8_000.0;
const TONE_HZ: f32 = 1_000.0;
const RF_CENTER: i64 = 100_000;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let settings = match std::env::args().nth(1) {
        Some(path) => {
            let config = Config::load_from(Path::new(&path))?;
            tracing::info!(%path, "loaded configuration");
            config.settings()
        }
        None => Settings {
            fft_size: 64,
            overlap: 0,
            num_avg: 4,
            log_coefficient: 0.0,
            rf_freq_units: true,
        },
    };

    // Ports and supervisor
    let in_port = InFloatPort::new("dataFloat_in");
    let fft_port = OutFloatPort::new("fft_dataFloat_out");
    let psd_port = OutFloatPort::new("psd_dataFloat_out");
    let psd_rx = psd_port.connect("demo-consumer");

    let mut supervisor = Supervisor::new(
        in_port.clone(),
        fft_port.clone(),
        psd_port.clone(),
        settings,
    );
    supervisor.start();

    // Producer: a pure tone, tagged with its RF center frequency
    let producer = thread::spawn(move || {
        let sri = Sri::new("tone", 1.0 / SAMPLE_RATE)
            .with_keyword("CHAN_RF", Keyword::Long(RF_CENTER));
        let writer = in_port.create_stream(sri);

        let chunk = 256u64;
        let mut sample_index = 0u64;
        for _ in 0..16 {
            let samples: Vec<f32> = (0..chunk)
                .map(|i| {
                    let t = (sample_index + i) as f32 / SAMPLE_RATE as f32;
                    (2.0 * PI * TONE_HZ * t).sin()
                })
                .collect();
            writer.write(&samples, sample_index as f64 / SAMPLE_RATE);
            sample_index += chunk;
            thread::sleep(Duration::from_millis(5));
        }
        writer.close();
    });

    // Consumer: report the strongest PSD bin per averaged block
    let mut current_sri: Option<Sri> = None;
    loop {
        match psd_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(StreamPacket::Sri { sri, .. }) => {
                tracing::info!(
                    xstart = sri.xstart,
                    xdelta = sri.xdelta,
                    subsize = sri.subsize,
                    "psd sri"
                );
                current_sri = Some(sri);
            }
            Ok(StreamPacket::Data { data, time, .. }) => {
                let peak = data
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                let freq = current_sri
                    .as_ref()
                    .map(|sri| sri.xstart + peak as f64 * sri.xdelta)
                    .unwrap_or(0.0);
                println!("t={time:.3}s  peak bin {peak}  ->  {freq:.0} Hz");
            }
            Ok(StreamPacket::Eos { .. }) => break,
            Err(_) => anyhow::bail!("timed out waiting for psd output"),
        }
    }

    producer.join().map_err(|_| anyhow::anyhow!("producer panicked"))?;
    supervisor.stop()?;
    Ok(())
}
