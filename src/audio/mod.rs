//! Mixer thread.
//!
//! Consumes the producer-side audio state at its own cadence: the
//! Sound Blaster DAC buffer (mutex-shared), the PC-speaker event
//! queue and the OPL FM event queue.  Rendered frames go into a ring
//! buffer; with the `audio` feature a cpal stream drains the ring,
//! otherwise the ring is simply bounded and trimmed.
//!
//! FM synthesis itself is out of scope here: FM events are consumed
//! and counted so the queues never back up, and the DAC/speaker paths
//! produce real samples.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;
use log::{debug, info};

use crate::devices::sblaster::Dac;
use crate::devices::speaker::SpeakerEvent;
use crate::devices::sblaster::opl::FmEvent;

const MIXER_RATE: u32 = 48_000;
/// ~170 ms of stereo frames, enough to absorb scheduling jitter.
const MAX_BUFFER_FRAMES: usize = 8192;

type AudioRing = Arc<Mutex<VecDeque<(i16, i16)>>>;

pub struct Mixer {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    ring: AudioRing,
}

/// Everything the mixer consumes from the machine side.
pub struct MixerSources {
    pub dac: Arc<Mutex<Dac>>,
    pub speaker: Receiver<SpeakerEvent>,
    pub fm: Receiver<FmEvent>,
}

impl Mixer {
    pub fn spawn(sources: MixerSources) -> Mixer {
        let shutdown = Arc::new(AtomicBool::new(false));
        let ring: AudioRing = Arc::new(Mutex::new(VecDeque::with_capacity(MAX_BUFFER_FRAMES)));

        let thread_shutdown = shutdown.clone();
        let thread_ring = ring.clone();
        let thread = thread::Builder::new()
            .name("mixer".into())
            .spawn(move || mixer_loop(sources, thread_ring, thread_shutdown))
            .expect("spawn mixer thread");

        info!("mixer thread started ({} Hz)", MIXER_RATE);
        Mixer {
            shutdown,
            thread: Some(thread),
            ring,
        }
    }

    /// Rendered frames waiting for the output device.
    pub fn buffered_frames(&self) -> usize {
        self.ring.lock().unwrap().len()
    }
}

impl Drop for Mixer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn mixer_loop(sources: MixerSources, ring: AudioRing, shutdown: Arc<AtomicBool>) {
    // speaker square-wave state
    let mut spk_level = false;
    let mut spk_active = false;
    let mut fm_events: u64 = 0;

    #[cfg(feature = "audio")]
    let _stream = output_stream(ring.clone());

    while !shutdown.load(Ordering::SeqCst) {
        // ── Sound Blaster DAC ─────────────────────────────────
        let mut samples = Vec::new();
        let (channels, speaker_on) = {
            let mut dac = sources.dac.lock().unwrap();
            dac.take_samples(&mut samples);
            (dac.channels, dac.speaker)
        };
        // ── PC speaker ────────────────────────────────────────
        for evt in sources.speaker.try_iter() {
            spk_active = evt.active;
            spk_level = evt.level;
        }
        // ── FM events (synthesis handled elsewhere) ───────────
        for _ in sources.fm.try_iter() {
            fm_events += 1;
        }

        let spk_sample: i16 = if spk_active && spk_level { 6000 } else { 0 };
        {
            let mut ring = ring.lock().unwrap();
            if channels == 2 {
                for pair in samples.chunks_exact(2) {
                    let l = dac_to_i16(pair[0], speaker_on) + spk_sample;
                    let r = dac_to_i16(pair[1], speaker_on) + spk_sample;
                    push_frame(&mut ring, l, r);
                }
            } else {
                for s in &samples {
                    let v = dac_to_i16(*s, speaker_on) + spk_sample;
                    push_frame(&mut ring, v, v);
                }
            }
            if samples.is_empty() && spk_sample != 0 {
                // keep the square wave alive between DAC bursts
                for _ in 0..(MIXER_RATE / 100) {
                    push_frame(&mut ring, spk_sample, spk_sample);
                }
            }
        }

        thread::sleep(Duration::from_millis(10));
    }
    debug!("mixer thread exiting ({} FM events consumed)", fm_events);
}

fn dac_to_i16(sample: u8, speaker_on: bool) -> i16 {
    if !speaker_on {
        return 0;
    }
    ((sample as i16) - 128) << 7
}

fn push_frame(ring: &mut VecDeque<(i16, i16)>, l: i16, r: i16) {
    if ring.len() >= MAX_BUFFER_FRAMES {
        ring.pop_front();
    }
    ring.push_back((l, r));
}

/// Host audio output.  The stream object owns the callback; keep it
/// alive for the life of the mixer thread.
#[cfg(feature = "audio")]
fn output_stream(ring: AudioRing) -> Option<cpal::Stream> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    let host = cpal::default_host();
    let device = host.default_output_device()?;
    let config = cpal::StreamConfig {
        channels: 2,
        sample_rate: cpal::SampleRate(MIXER_RATE),
        buffer_size: cpal::BufferSize::Default,
    };
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut ring = ring.lock().unwrap();
                for frame in data.chunks_exact_mut(2) {
                    let (l, r) = ring.pop_front().unwrap_or((0, 0));
                    frame[0] = l as f32 / 32768.0;
                    frame[1] = r as f32 / 32768.0;
                }
            },
            move |err| {
                log::error!("audio stream error: {}", err);
            },
            None,
        )
        .ok()?;
    stream.play().ok()?;
    Some(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::sblaster::DacState;
    use crate::devices::speaker::PcSpeaker;

    #[test]
    fn mixer_drains_dac_buffer() {
        let dac = Arc::new(Mutex::new(Dac::default()));
        let (spk, spk_rx) = PcSpeaker::new();
        let (_opl, fm_rx) = crate::devices::sblaster::opl::Opl::new();
        {
            let mut d = dac.lock().unwrap();
            d.speaker = true;
            d.state = DacState::Active;
            for i in 0..100 {
                d.add_sample(i as u8);
            }
        }
        spk.add_event(0, true, true);
        let mixer = Mixer::spawn(MixerSources {
            dac: dac.clone(),
            speaker: spk_rx,
            fm: fm_rx,
        });
        for _ in 0..100 {
            if dac.lock().unwrap().used == 0 && mixer.buffered_frames() > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(dac.lock().unwrap().used, 0);
        assert!(mixer.buffered_frames() > 0);
    }
}
