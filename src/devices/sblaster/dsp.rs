//! DSP command table and handlers.
//!
//! Opcode → (version mask, parameter count, published execution time,
//! operation).  The firmware jump table repeats entries between DSP
//! generations, so the decode is filtered by the version mask of the
//! installed chip.

use log::{debug, trace};

use crate::machine::DevCtx;

use super::{DacState, Decoder, DspMode, SBlaster, SbDmaMode, SB16_COPYRIGHT};

pub const DSP1: u8 = 0x1;
pub const DSP2: u8 = 0x2;
pub const DSP3: u8 = 0x4;
pub const DSP4: u8 = 0x8;
pub const DSPALL: u8 = 0xF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DspOp {
    Unimpl,
    Status,
    DirectDac,
    DmaDac { bits: u8, reference: bool, auto: bool, hispeed: bool },
    DmaAdc { auto: bool },
    MidiUart { polling: bool },
    MidiOut,
    SetTimeConst,
    SetDmaBlock,
    PauseDma,
    SpeakerOn,
    SpeakerOff,
    ContinueDma,
    SpeakerStatus,
    ExitAiDma,
    Identify,
    GetVersion,
    IdentifyDma,
    Copyright,
    WriteTestReg,
    ReadTestReg,
    AuxStatus,
    TriggerIrq,
    F8Unknown,
    PauseDac,
}

#[derive(Debug, Clone, Copy)]
pub struct DspCmd {
    pub vmask: u8,
    pub len: usize,
    pub time_us: u32,
    pub op: DspOp,
}

const fn cmd(vmask: u8, len: usize, time_us: u32, op: DspOp) -> DspCmd {
    DspCmd { vmask, len, time_us, op }
}

/// Decode an opcode for the installed DSP generation.
pub(super) fn decode(opcode: u8, version_mask: u8) -> Option<DspCmd> {
    use DspOp::*;
    let entry = match opcode {
        0x04 => cmd(DSP2 | DSP3, 0, 0, Status),
        0x10 => cmd(DSPALL, 1, 0, DirectDac),
        0x14 | 0x15 => cmd(DSPALL, 2, 0, DmaDac { bits: 8, reference: false, auto: false, hispeed: false }),
        0x16 => cmd(DSPALL, 2, 0, DmaDac { bits: 2, reference: false, auto: false, hispeed: false }),
        0x17 => cmd(DSPALL, 2, 0, DmaDac { bits: 2, reference: true, auto: false, hispeed: false }),
        0x1C => cmd(DSP2 | DSP3 | DSP4, 0, 0, DmaDac { bits: 8, reference: false, auto: true, hispeed: false }),
        0x1F => cmd(DSP2 | DSP3 | DSP4, 0, 0, DmaDac { bits: 2, reference: true, auto: true, hispeed: false }),
        0x20 => cmd(DSPALL, 0, 0, Unimpl), // direct ADC
        0x24 => cmd(DSPALL, 2, 0, DmaAdc { auto: false }),
        0x28 => cmd(DSP1 | DSP2 | DSP3, 0, 0, Unimpl), // burst ADC
        0x2C => cmd(DSP2 | DSP3 | DSP4, 0, 0, Unimpl), // auto-init ADC
        0x30 | 0x31 => cmd(DSPALL, 0, 0, Unimpl),      // MIDI input modes
        0x34 => cmd(DSP2 | DSP3 | DSP4, 0, 0, MidiUart { polling: true }),
        0x35 => cmd(DSP2 | DSP3 | DSP4, 0, 0, MidiUart { polling: false }),
        0x36 | 0x37 => cmd(DSP2 | DSP3 | DSP4, 0, 0, MidiUart { polling: false }),
        0x38 => cmd(DSPALL, 1, 0, MidiOut),
        0x40 => cmd(DSPALL, 1, 0, SetTimeConst),
        0x41 => cmd(DSP4, 2, 0, Unimpl), // set output sample rate
        0x45 | 0x47 => cmd(DSP4, 0, 0, Unimpl),
        0x48 => cmd(DSP2 | DSP3 | DSP4, 2, 0, SetDmaBlock),
        0x74 => cmd(DSPALL, 2, 0, DmaDac { bits: 4, reference: false, auto: false, hispeed: false }),
        0x75 => cmd(DSPALL, 2, 0, DmaDac { bits: 4, reference: true, auto: false, hispeed: false }),
        0x76 => cmd(DSPALL, 2, 0, DmaDac { bits: 3, reference: false, auto: false, hispeed: false }),
        0x77 => cmd(DSPALL, 2, 0, DmaDac { bits: 3, reference: true, auto: false, hispeed: false }),
        0x7D => cmd(DSP2 | DSP3 | DSP4, 0, 0, DmaDac { bits: 4, reference: true, auto: true, hispeed: false }),
        0x7F => cmd(DSP2 | DSP3 | DSP4, 0, 0, DmaDac { bits: 3, reference: true, auto: true, hispeed: false }),
        0x80 => cmd(DSPALL, 2, 0, PauseDac),
        0x90 => cmd(DSP2 | DSP3, 0, 0, DmaDac { bits: 8, reference: false, auto: true, hispeed: true }),
        0x91 => cmd(DSP2 | DSP3, 0, 0, DmaDac { bits: 8, reference: false, auto: false, hispeed: true }),
        0x98 | 0x99 => cmd(DSP2 | DSP3, 0, 0, Unimpl), // high-speed ADC
        0xB0..=0xBF => cmd(DSP4, 3, 0, Unimpl),        // generic 16-bit DMA
        0xC0..=0xCF => cmd(DSP4, 3, 0, Unimpl),        // generic 8-bit DMA
        0xD0 => cmd(DSPALL, 0, 0, PauseDma),
        0xD1 => cmd(DSPALL, 0, 0, SpeakerOn),
        0xD3 => cmd(DSPALL, 0, 0, SpeakerOff),
        0xD4 => cmd(DSPALL, 0, 0, ContinueDma),
        0xD5 | 0xD6 | 0xD9 => cmd(DSP4, 0, 0, Unimpl), // 16-bit DMA control
        0xD8 => cmd(DSP2 | DSP3 | DSP4, 0, 0, SpeakerStatus),
        0xDA => cmd(DSP2 | DSP3 | DSP4, 0, 0, ExitAiDma),
        0xE0 => cmd(DSP2 | DSP3 | DSP4, 1, 0, Identify),
        0xE1 => cmd(DSPALL, 0, 0, GetVersion),
        0xE2 => cmd(DSPALL, 1, 0, IdentifyDma),
        0xE3 => cmd(DSP3 | DSP4, 0, 0, Copyright),
        0xE4 => cmd(DSP2 | DSP3 | DSP4, 1, 0, WriteTestReg),
        0xE8 => cmd(DSP2 | DSP3 | DSP4, 0, 0, ReadTestReg),
        0xF0 => cmd(DSPALL, 0, 0, Unimpl), // sine generator
        0xF1 => cmd(DSP1 | DSP2 | DSP3, 0, 0, AuxStatus),
        0xF2 => cmd(DSPALL, 0, 20, TriggerIrq),
        0xF8 => cmd(DSP1 | DSP2 | DSP3, 0, 0, F8Unknown),
        _ => return None,
    };
    if entry.vmask & version_mask != 0 {
        Some(entry)
    } else {
        None
    }
}

/// Execute a decoded command; parameters are in `dsp.cmd_in`.
pub(super) fn exec(sb: &mut SBlaster, op: DspOp, ctx: &mut DevCtx) {
    use DspOp::*;
    match op {
        Unimpl => {
            debug!("SB DSP: command 0x{:02X} not implemented", sb.dsp.cmd);
        }
        Status => {
            sb.dsp.out_buf.flush();
            let v = match sb.dsp_version() >> 8 {
                2 => 0x88,
                3 => 0x7B,
                _ => 0xFF,
            };
            sb.dsp.out_buf.write(v);
        }
        DirectDac => {
            // rate is whatever cadence the program manages; average
            // the gap between writes to keep the watchdog honest
            sb.dsp_change_mode(DspMode::Dac);
            sb.dac_set_state(DacState::Active, ctx);
            sb.dsp.decoder = Decoder::Pcm;
            let now = ctx.now_ns();
            let sample = sb.dsp.cmd_in[0];
            let fire_irq;
            {
                let mut dac = sb.dac.lock().unwrap();
                if dac.used > 0 {
                    let avg_diff = (now - dac.sample_time_ns[0]) as f64 / dac.used as f64;
                    dac.rate = 1e9 / avg_diff;
                    drop(dac);
                    ctx.activate_timer(sb.dac_timer, (avg_diff * 10.0) as u64);
                    dac = sb.dac.lock().unwrap();
                }
                let ix = (dac.used > 0) as usize;
                dac.sample_time_ns[ix] = now;
                fire_irq = dac.add_sample(sample);
            }
            if fire_irq {
                sb.raise_interrupt(ctx.pic, ctx.intr);
            }
        }
        DmaDac { bits, reference, auto, hispeed } => {
            sb.dsp.decoder = match bits {
                2 => Decoder::Adpcm2,
                3 => Decoder::Adpcm3,
                4 => Decoder::Adpcm4,
                _ => Decoder::Pcm,
            };
            sb.dsp.high_speed = hispeed;
            sb.dsp.adpcm.have_reference = reference;
            sb.dma.autoinit = auto;
            sb.dma_start();
            sb.dma_timer(false, ctx); // DRQ
            sb.dac_set_state(DacState::Active, ctx);
            debug!(
                "SB DSP: starting {} {} DMA DAC {}-bit",
                if auto { "auto-init" } else { "single-cycle" },
                if hispeed { "high-speed" } else { "normal" },
                bits
            );
        }
        DmaAdc { auto } => {
            sb.dma.autoinit = auto;
            sb.dma_start();
            ctx.deactivate_timer(sb.dma_timer);
            sb.dma_timer(false, ctx);
            debug!("SB DSP: starting DMA ADC (silence)");
        }
        MidiUart { polling } => {
            sb.dsp_change_mode(DspMode::MidiUart);
            sb.dsp.midi_polling = polling;
        }
        MidiOut => {
            trace!("SB DSP: MIDI out 0x{:02X}", sb.dsp.cmd_in[0]);
        }
        SetTimeConst => {
            sb.dsp.time_const = sb.dsp.cmd_in[0];
            sb.dsp_update_frequency();
            // a WAITING DAC keeps generating at the new cadence
            let (state, period) = {
                let dac = sb.dac.lock().unwrap();
                (dac.state, dac.period_ns)
            };
            if state == DacState::Waiting {
                ctx.activate_timer_periodic(sb.dac_timer, period, period);
            }
        }
        SetDmaBlock => {
            sb.dma.count = sb.dsp.cmd_in[0] as u16 | (sb.dsp.cmd_in[1] as u16) << 8;
            trace!("SB DMA: block size={} bytes", sb.dma.count as u32 + 1);
        }
        PauseDma => {
            if sb.dma.mode != SbDmaMode::Dma8 {
                trace!("SB DSP: pause DMA with DMA not active");
                return;
            }
            sb.dsp_change_mode(DspMode::DmaPaused);
            sb.dma_stop(ctx);
            let state = sb.dac.lock().unwrap().state;
            if state == DacState::Active {
                sb.dac_set_state(DacState::Waiting, ctx);
            }
        }
        ContinueDma => {
            if sb.dma.mode != SbDmaMode::Dma8 {
                trace!("SB DSP: continue DMA with DMA not active");
                return;
            }
            sb.dma_timer(false, ctx);
            sb.dsp_change_mode(DspMode::Dma);
            sb.dac_set_state(DacState::Active, ctx);
        }
        ExitAiDma => {
            if sb.dma.mode != SbDmaMode::Dma8 {
                trace!("SB DSP: exit auto-init while DMA not active");
            }
            // exits at the end of the current block
            sb.dma.autoinit = false;
        }
        SpeakerOn => {
            sb.dac.lock().unwrap().speaker = true;
        }
        SpeakerOff => {
            sb.dac.lock().unwrap().speaker = false;
        }
        SpeakerStatus => {
            sb.dsp.out_buf.flush();
            let speaker = sb.dac.lock().unwrap().speaker;
            sb.dsp.out_buf.write(if speaker { 0xFF } else { 0x00 });
        }
        Identify => {
            sb.dsp.out_buf.flush();
            let v = !sb.dsp.cmd_in[0];
            sb.dsp.out_buf.write(v);
        }
        GetVersion => {
            sb.dsp.out_buf.flush();
            let ver = sb.dsp_version();
            sb.dsp.out_buf.write((ver >> 8) as u8);
            sb.dsp.out_buf.write(ver as u8);
        }
        IdentifyDma => {
            // reverse engineered from the SB16 firmware
            sb.dma.identify_vadd = sb
                .dma
                .identify_vadd
                .wrapping_add(sb.dsp.cmd_in[0] ^ sb.dma.identify_vxor);
            sb.dma.identify_vxor = sb.dma.identify_vxor.rotate_right(2);
            sb.dma.mode = SbDmaMode::Identify;
            let chan = sb.dma_channel();
            ctx.dma.set_drq(chan, true);
        }
        Copyright => {
            sb.dsp.out_buf.flush();
            for b in SB16_COPYRIGHT.bytes() {
                sb.dsp.out_buf.write(b);
            }
            sb.dsp.out_buf.write(0);
        }
        WriteTestReg => {
            sb.dsp.test_reg = sb.dsp.cmd_in[0];
        }
        ReadTestReg => {
            sb.dsp.out_buf.flush();
            let v = sb.dsp.test_reg;
            sb.dsp.out_buf.write(v);
        }
        AuxStatus => {
            sb.dsp.out_buf.flush();
            let speaker = sb.dac.lock().unwrap().speaker;
            sb.dsp.out_buf.write(!speaker as u8 | 0x12);
        }
        TriggerIrq => {
            sb.raise_interrupt(ctx.pic, ctx.intr);
        }
        F8Unknown => {
            sb.dsp.out_buf.flush();
            sb.dsp.out_buf.write(0);
        }
        PauseDac => {
            let count = sb.dsp.cmd_in[0] as u32 + ((sb.dsp.cmd_in[1] as u32) << 8) + 1;
            trace!("SB DSP: firing IRQ in {} samples", count);
            let state = {
                let mut dac = sb.dac.lock().unwrap();
                dac.irq_count = count;
                dac.state
            };
            if state == DacState::Stopped {
                sb.dac_set_state(DacState::Active, ctx);
                sb.dac_set_state(DacState::Waiting, ctx);
            }
        }
    }
}

