use approx::assert_abs_diff_eq;
use oscillo::{
    calibrate::{calibrate, Settings},
    common::{Sampling, SettleDelays},
    oscillo::{Oscillo, OscilloConfig},
    sim::SimDevice,
};
use std::f64::consts::PI;

fn simulated(sim: SimDevice) -> Oscillo<SimDevice> {
    let config = OscilloConfig {
        delays: SettleDelays::none(),
        seed: Some(2024),
        ..Default::default()
    };
    Oscillo::new(sim, config).unwrap()
}

/// A two-tone target in ADC counts, well inside the correction window
fn ideal() -> Vec<f64> {
    (0..8192)
        .map(|i| {
            let t = f64::from(i) / 8192.0;
            1500.0 * (2.0 * PI * 8.0 * t).sin() + 400.0 * (2.0 * PI * 40.0 * t).cos()
        })
        .collect()
}

#[test]
fn closed_loop_converges_on_lowpass() {
    let sim = SimDevice::new(Sampling::default()).with_lowpass(5e6, 0.9);
    let mut osc = simulated(sim);
    osc.set_ideal_waveform(ideal()).unwrap();
    let settings = Settings {
        channel: 0,
        trials: 4,
        iterations: 8,
        alpha: 0.8,
    };
    let report = calibrate(&mut osc, &settings).unwrap();
    assert_eq!(report.error_rms.len(), 8);
    let first = report.initial().unwrap();
    let last = report.last().unwrap();
    assert!(last < 0.05 * first, "{first} -> {last}");
    assert!(!osc.is_failed());

    // The ADC now follows the target
    osc.acquire().unwrap();
    let adc = osc.adc().row(0).to_owned();
    let mean = adc.mean().unwrap();
    for (a, i) in adc.iter().zip(ideal()) {
        assert_abs_diff_eq!(a - mean, i, epsilon = 50.0);
    }
}

#[test]
fn noisy_estimate_still_close() {
    let sim = SimDevice::new(Sampling::default())
        .with_noise(2.0, 11)
        .unwrap();
    let expected = sim.transfer_function();
    let mut osc = simulated(sim);
    osc.estimate_transfer_function(0, 0, 16).unwrap();
    // Compare the magnitude over the lower half of the band
    for (h, e) in osc.transfer_function().iter().zip(&expected).skip(1).take(2048) {
        assert!((h.norm() - e.norm()).abs() / e.norm() < 0.05);
    }
}

#[test]
fn averaging_is_transparent() {
    let mut osc = simulated(SimDevice::new(Sampling::default()));
    osc.dac_mut(1)
        .unwrap()
        .iter_mut()
        .enumerate()
        .for_each(|(i, d)| *d = 0.3 * (2.0 * PI * 3.0 * i as f64 / 8192.0).sin());
    osc.set_dac().unwrap();
    osc.acquire().unwrap();
    let plain = osc.adc().clone();
    osc.set_averaging(true).unwrap();
    osc.registers_mut().set_averages(16);
    osc.acquire().unwrap();
    for (a, b) in plain.iter().zip(osc.adc()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-9);
    }
}
