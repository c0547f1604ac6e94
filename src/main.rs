#![deny(clippy::all)]
#![warn(clippy::pedantic)]

use clap::Parser;
use eyre::eyre;
use oscillo::{
    args::{Cli, Command},
    calibrate::{self, write_to_file, Report, Settings},
    common::{Sampling, SettleDelays},
    device::Registers,
    mmap::DevMem,
    oscillo::{Oscillo, OscilloConfig},
    sim::SimDevice,
};
use std::{fs, path::Path, time::Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn read_ideal(path: &Path) -> eyre::Result<Vec<f64>> {
    fs::read_to_string(path)?
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            l.trim()
                .parse::<f64>()
                .map_err(|e| eyre!("Bad sample {l:?} in {} - {e}", path.display()))
        })
        .collect()
}

fn run<R: Registers>(mut osc: Oscillo<R>, cli: &Cli) -> eyre::Result<()> {
    osc.set_averaging(cli.averaging)?;
    osc.set_adc_offset([cli.adc_offset[0], cli.adc_offset[1]]);
    osc.set_optical_power([cli.optical_power[0], cli.optical_power[1]]);
    osc.set_power([cli.power[0], cli.power[1]]);
    match &cli.command {
        Command::Transfer {
            out_channel,
            in_channel,
            trials,
            output,
        } => {
            osc.estimate_transfer_function(*out_channel, *in_channel, *trials)?;
            if let Some(dir) = output {
                calibrate::save(&osc, &Report::default(), *out_channel, dir)?;
            }
        }
        Command::Calibrate {
            ideal,
            channel,
            trials,
            iterations,
            alpha,
            output,
        } => {
            osc.set_ideal_waveform(read_ideal(ideal)?)?;
            let settings = Settings {
                channel: *channel,
                trials: *trials,
                iterations: *iterations,
                alpha: *alpha,
            };
            let report = calibrate::calibrate(&mut osc, &settings)?;
            if let (Some(first), Some(last)) = (report.initial(), report.last()) {
                info!("Amplitude error RMS went from {first:.4} to {last:.4}");
            }
            if let Some(dir) = output {
                calibrate::save(&osc, &report, *channel, dir)?;
            }
        }
        Command::Spectrum { averages, output } => {
            let spectrum = osc.get_avg_spectrum(*averages)?;
            if let Some(dir) = output {
                fs::create_dir_all(dir)?;
                write_to_file(spectrum.row(0).iter(), &dir.join("spectrum_1"))?;
                write_to_file(spectrum.row(1).iter(), &dir.join("spectrum_2"))?;
                info!("Spectra written to {}", dir.display());
            }
        }
    }
    Ok(())
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Get the CLI options
    let cli = Cli::parse();

    let sampling = Sampling::default();
    let config = OscilloConfig {
        sampling,
        delays: if cli.simulate {
            SettleDelays::none()
        } else {
            SettleDelays {
                capture: Duration::from_millis(cli.capture_delay_ms),
                probe: Duration::from_millis(cli.probe_delay_ms),
            }
        },
        seed: cli.seed,
        ..Default::default()
    };

    if cli.simulate {
        info!("Running against a simulated board");
        run(Oscillo::new(SimDevice::new(sampling), config)?, &cli)
    } else {
        info!("Mapping {}", cli.dev_mem.display());
        run(Oscillo::new(DevMem::open(&cli.dev_mem, sampling.n)?, config)?, &cli)
    }
}
