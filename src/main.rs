//! Headless machine harness.
//!
//! Boots the device subsystem from a JSON configuration, runs it for
//! a slice of virtual time and dumps per-device status.  The CPU is
//! not part of this crate: the harness only exercises the port-I/O,
//! timer and DMA plumbing the real front-end would drive.

use std::path::PathBuf;
use std::process::ExitCode;

use quartz::config::MachineConfig;
use quartz::machine::clock::MSEC;
use quartz::machine::Machine;

struct Args {
    config: Option<PathBuf>,
    run_ms: u64,
    write_config: Option<PathBuf>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        config: None,
        run_ms: 1000,
        write_config: None,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                args.config = Some(PathBuf::from(
                    it.next().ok_or("--config needs a path")?,
                ));
            }
            "--run-ms" => {
                args.run_ms = it
                    .next()
                    .ok_or("--run-ms needs a value")?
                    .parse()
                    .map_err(|e| format!("--run-ms: {}", e))?;
            }
            "--write-config" => {
                args.write_config = Some(PathBuf::from(
                    it.next().ok_or("--write-config needs a path")?,
                ));
            }
            "--help" | "-h" => {
                return Err("usage: quartz [--config FILE] [--run-ms N] [--write-config FILE]"
                    .to_string());
            }
            other => return Err(format!("unknown argument '{}'", other)),
        }
    }
    Ok(args)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let config = match &args.config {
        Some(path) => MachineConfig::load(path),
        None => MachineConfig::default(),
    };
    if let Some(path) = &args.write_config {
        config.save(path);
        println!("wrote configuration to '{}'", path.display());
        return ExitCode::SUCCESS;
    }

    let mut machine = match Machine::new(&config) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("machine assembly failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // a minimal POST-like warm-up: program the PIC pair and let the
    // PIT tick IRQ0 at ~18.2 Hz like the BIOS would
    machine.io_write(0x20, 1, 0x11);
    machine.io_write(0x21, 1, 0x08);
    machine.io_write(0x21, 1, 0x04);
    machine.io_write(0x21, 1, 0x01);
    machine.io_write(0xA0, 1, 0x11);
    machine.io_write(0xA1, 1, 0x70);
    machine.io_write(0xA1, 1, 0x02);
    machine.io_write(0xA1, 1, 0x01);
    machine.io_write(0x21, 1, 0x00);
    machine.io_write(0xA1, 1, 0x00);
    machine.io_write(0x43, 1, 0x34);
    machine.io_write(0x40, 1, 0x00);
    machine.io_write(0x40, 1, 0x00);

    let mut irqs: u64 = 0;
    let slice = 10 * MSEC;
    let mut elapsed_ms = 0;
    while elapsed_ms < args.run_ms {
        machine.run_for(slice);
        elapsed_ms += 10;
        while machine.intr() {
            let vector = machine.iac();
            irqs += 1;
            if vector == 0x08 {
                // BIOS tick handler would EOI
                machine.io_write(0x20, 1, 0x20);
            }
        }
    }

    println!("ran {} ms of virtual time, {} interrupts", args.run_ms, irqs);
    print!("{}", machine.status_report());
    machine.power_off();
    ExitCode::SUCCESS
}
