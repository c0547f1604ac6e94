use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Run against a simulated board instead of /dev/mem
    #[arg(long, short)]
    pub simulate: bool,
    /// Physical memory device of the board
    #[arg(long, default_value = "/dev/mem")]
    pub dev_mem: PathBuf,
    /// Seed for the probe phases (random if not given)
    #[arg(long)]
    pub seed: Option<u64>,
    /// Time to wait after latching a capture
    #[arg(long, default_value_t = 1)]
    pub capture_delay_ms: u64,
    /// Time to wait after changing the DAC waveform
    #[arg(long, default_value_t = 10)]
    pub probe_delay_ms: u64,
    /// Enable hardware averaging on the ADCs
    #[arg(long, short)]
    pub averaging: bool,
    /// Per-channel ADC offsets, in counts
    #[arg(long, num_args = 2, default_values_t = [0.0, 0.0])]
    pub adc_offset: Vec<f64>,
    /// Per-channel optical power, multiplies the ADC samples
    #[arg(long, num_args = 2, default_values_t = [1.0, 1.0])]
    pub optical_power: Vec<f64>,
    /// Per-channel power, divides the ADC samples
    #[arg(long, num_args = 2, default_values_t = [1.0, 1.0])]
    pub power: Vec<f64>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Measure the DAC to ADC transfer function
    Transfer {
        #[arg(long, default_value_t = 0)]
        out_channel: usize,
        #[arg(long, default_value_t = 0)]
        in_channel: usize,
        /// Number of white-noise probes to average
        #[arg(long, short, default_value_t = 100)]
        trials: usize,
        /// Directory to write results to
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Pre-distort a DAC channel so ADC 1 follows an ideal waveform
    Calibrate {
        /// File of newline separated samples, one per ADC sample
        ideal: PathBuf,
        #[arg(long, short, default_value_t = 0)]
        channel: usize,
        /// Number of white-noise probes to average
        #[arg(long, short, default_value_t = 100)]
        trials: usize,
        #[arg(long, short, default_value_t = 20)]
        iterations: usize,
        /// Step size of the pre-distortion loop
        #[arg(long, default_value_t = 1.0)]
        alpha: f64,
        /// Directory to write results to
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Average magnitude spectra of both ADC channels
    Spectrum {
        #[arg(long, short = 'n', default_value_t = 10)]
        averages: usize,
        /// Directory to write results to
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibration_vectors_default_to_unity() {
        let cli = Cli::try_parse_from(["oscillo", "spectrum"]).unwrap();
        assert_eq!(cli.adc_offset, [0.0, 0.0]);
        assert_eq!(cli.optical_power, [1.0, 1.0]);
        assert_eq!(cli.power, [1.0, 1.0]);
    }

    #[test]
    fn calibration_vectors_take_two_values() {
        let cli = Cli::try_parse_from([
            "oscillo",
            "--adc-offset",
            "3",
            "4",
            "--optical-power",
            "0.5",
            "2",
            "--power",
            "2",
            "8",
            "spectrum",
        ])
        .unwrap();
        assert_eq!(cli.adc_offset, [3.0, 4.0]);
        assert_eq!(cli.optical_power, [0.5, 2.0]);
        assert_eq!(cli.power, [2.0, 8.0]);
        assert!(Cli::try_parse_from(["oscillo", "--power", "2", "spectrum"]).is_err());
    }
}
