// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Stereo effect processors for send buses.

use std::time::Duration;

use super::EffectSpec;

/// Knee width used by every compressor.
const COMPRESSOR_KNEE_DB: f32 = 30.0;

/// Comb delays in frames at 44.1kHz. The first half feeds the left side.
const COMB_TUNINGS: [usize; 8] = [1557, 1617, 1491, 1422, 1277, 1356, 1188, 1116];
const ALLPASS_TUNINGS: [usize; 4] = [225, 556, 441, 341];
const ALLPASS_FEEDBACK: f32 = 0.5;

/// A block processor for a stereo signal.
pub trait Effect: Send {
    /// Processes the block in place. Both slices have the same length.
    fn process(&mut self, left: &mut [f32], right: &mut [f32]);
}

/// Builds the processor for an effect stage.
pub fn build(spec: &EffectSpec, sample_rate: u32) -> Box<dyn Effect> {
    let sample_rate = sample_rate as f32;
    match *spec {
        EffectSpec::Lowpass { frequency } => Box::new(Lowpass::new(sample_rate, frequency)),
        EffectSpec::Compressor {
            threshold_db,
            ratio,
            attack,
            release,
        } => Box::new(Compressor::new(
            sample_rate,
            threshold_db,
            ratio,
            attack,
            release,
        )),
        EffectSpec::Reverb {
            room_size,
            dampening,
            wet,
        } => Box::new(Reverb::new(sample_rate, room_size, dampening, wet)),
        EffectSpec::FeedbackDelay {
            delay,
            feedback,
            wet,
        } => Box::new(FeedbackDelay::new(sample_rate, delay, feedback, wet)),
    }
}

/// `exp(-2π f / sr)`, the pole of a one-pole lowpass at `frequency`.
fn one_pole_coefficient(sample_rate: f32, frequency: f32) -> f32 {
    (-std::f32::consts::TAU * frequency / sample_rate).exp()
}

/// Smoothing coefficient reaching ~63% of a step after `time`.
fn time_coefficient(sample_rate: f32, time: Duration) -> f32 {
    let frames = time.as_secs_f32() * sample_rate;
    if frames <= 0.0 {
        0.0
    } else {
        (-1.0 / frames).exp()
    }
}

#[derive(Debug, Clone, Default)]
struct OnePole {
    state: f32,
    coeff: f32,
}

impl OnePole {
    fn new(coeff: f32) -> Self {
        Self { state: 0.0, coeff }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        self.state = input + self.coeff * (self.state - input);
        if self.state.abs() < 1e-20 {
            self.state = 0.0;
        }
        self.state
    }
}

/// 6 dB/octave lowpass.
pub struct Lowpass {
    left: OnePole,
    right: OnePole,
}

impl Lowpass {
    pub fn new(sample_rate: f32, frequency: f32) -> Self {
        let coeff = one_pole_coefficient(sample_rate, frequency);
        Self {
            left: OnePole::new(coeff),
            right: OnePole::new(coeff),
        }
    }
}

impl Effect for Lowpass {
    fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        for sample in left.iter_mut() {
            *sample = self.left.process(*sample);
        }
        for sample in right.iter_mut() {
            *sample = self.right.process(*sample);
        }
    }
}

/// Feed-forward, stereo-linked compressor with a soft knee.
pub struct Compressor {
    threshold_db: f32,
    ratio: f32,
    attack_coeff: f32,
    release_coeff: f32,
    envelope_db: f32,
}

impl Compressor {
    pub fn new(
        sample_rate: f32,
        threshold_db: f32,
        ratio: f32,
        attack: Duration,
        release: Duration,
    ) -> Self {
        Self {
            threshold_db,
            ratio: ratio.max(1.0),
            attack_coeff: time_coefficient(sample_rate, attack),
            release_coeff: time_coefficient(sample_rate, release),
            envelope_db: 0.0,
        }
    }

    /// Static gain reduction (negative dB) for a level.
    fn gain_db(&self, input_db: f32) -> f32 {
        let overshoot = input_db - self.threshold_db;
        let slope = 1.0 - 1.0 / self.ratio;
        if overshoot <= -COMPRESSOR_KNEE_DB / 2.0 {
            0.0
        } else if overshoot > COMPRESSOR_KNEE_DB / 2.0 {
            -overshoot * slope
        } else {
            let x = overshoot + COMPRESSOR_KNEE_DB / 2.0;
            -slope * x * x / (2.0 * COMPRESSOR_KNEE_DB)
        }
    }
}

impl Effect for Compressor {
    fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let peak = l.abs().max(r.abs()).max(1e-9);
            let target = self.gain_db(20.0 * peak.log10());
            // Reduction is negative: moving further down is the attack phase.
            let coeff = if target < self.envelope_db {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.envelope_db = target + coeff * (self.envelope_db - target);
            let gain = 10f32.powf(self.envelope_db / 20.0);
            *l *= gain;
            *r *= gain;
        }
    }
}

struct Comb {
    buffer: Vec<f32>,
    index: usize,
    feedback: f32,
    damping: OnePole,
}

impl Comb {
    fn new(size: usize, feedback: f32, damping: f32) -> Self {
        Self {
            buffer: vec![0.0; size.max(1)],
            index: 0,
            feedback,
            damping: OnePole::new(damping),
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let output = self.buffer[self.index];
        let filtered = self.damping.process(output);
        self.buffer[self.index] = input + filtered * self.feedback;
        self.index = (self.index + 1) % self.buffer.len();
        output
    }
}

struct Allpass {
    buffer: Vec<f32>,
    index: usize,
}

impl Allpass {
    fn new(size: usize) -> Self {
        Self {
            buffer: vec![0.0; size.max(1)],
            index: 0,
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let delayed = self.buffer[self.index];
        let output = delayed - input;
        self.buffer[self.index] = input + delayed * ALLPASS_FEEDBACK;
        self.index = (self.index + 1) % self.buffer.len();
        output
    }
}

/// Freeverb-style reverb: parallel lowpass-feedback combs into serial allpasses.
pub struct Reverb {
    combs_left: Vec<Comb>,
    combs_right: Vec<Comb>,
    allpasses_left: Vec<Allpass>,
    allpasses_right: Vec<Allpass>,
    wet: f32,
}

impl Reverb {
    /// `room_size` is the comb feedback in [0, 1). `dampening` is the cutoff of the
    /// lowpass inside each comb's feedback path, in Hz.
    pub fn new(sample_rate: f32, room_size: f32, dampening: f32, wet: f32) -> Self {
        let scale = sample_rate / 44100.0;
        let feedback = room_size.clamp(0.0, 0.98);
        let damping = one_pole_coefficient(sample_rate, dampening);
        let scaled = |size: usize| (size as f32 * scale) as usize;

        let (left_tunings, right_tunings) = COMB_TUNINGS.split_at(COMB_TUNINGS.len() / 2);
        Self {
            combs_left: left_tunings
                .iter()
                .map(|&size| Comb::new(scaled(size), feedback, damping))
                .collect(),
            combs_right: right_tunings
                .iter()
                .map(|&size| Comb::new(scaled(size), feedback, damping))
                .collect(),
            allpasses_left: ALLPASS_TUNINGS
                .iter()
                .map(|&size| Allpass::new(scaled(size)))
                .collect(),
            allpasses_right: ALLPASS_TUNINGS
                .iter()
                .map(|&size| Allpass::new(scaled(size)))
                .collect(),
            wet: wet.clamp(0.0, 1.0),
        }
    }
}

fn reverberate(input: f32, combs: &mut [Comb], allpasses: &mut [Allpass]) -> f32 {
    let mut output: f32 = combs.iter_mut().map(|comb| comb.process(input)).sum();
    for allpass in allpasses.iter_mut() {
        output = allpass.process(output);
    }
    output
}

impl Effect for Reverb {
    fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let wet_l = reverberate(*l, &mut self.combs_left, &mut self.allpasses_left);
            let wet_r = reverberate(*r, &mut self.combs_right, &mut self.allpasses_right);
            *l = *l * (1.0 - self.wet) + wet_l * self.wet;
            *r = *r * (1.0 - self.wet) + wet_r * self.wet;
        }
    }
}

/// A delay line whose output is fed back into its input.
pub struct FeedbackDelay {
    left: Vec<f32>,
    right: Vec<f32>,
    index: usize,
    feedback: f32,
    wet: f32,
}

impl FeedbackDelay {
    pub fn new(sample_rate: f32, delay: Duration, feedback: f32, wet: f32) -> Self {
        let frames = ((delay.as_secs_f32() * sample_rate).round() as usize).max(1);
        Self {
            left: vec![0.0; frames],
            right: vec![0.0; frames],
            index: 0,
            feedback: feedback.clamp(0.0, 0.99),
            wet: wet.clamp(0.0, 1.0),
        }
    }
}

impl Effect for FeedbackDelay {
    fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let delayed_l = self.left[self.index];
            let delayed_r = self.right[self.index];
            self.left[self.index] = *l + delayed_l * self.feedback;
            self.right[self.index] = *r + delayed_r * self.feedback;
            self.index = (self.index + 1) % self.left.len();

            *l = *l * (1.0 - self.wet) + delayed_l * self.wet;
            *r = *r * (1.0 - self.wet) + delayed_r * self.wet;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn impulse(len: usize) -> (Vec<f32>, Vec<f32>) {
        let mut left = vec![0.0; len];
        let mut right = vec![0.0; len];
        left[0] = 1.0;
        right[0] = 1.0;
        (left, right)
    }

    #[test]
    fn test_lowpass_passes_dc_and_attenuates_nyquist() {
        let mut lp = Lowpass::new(48000.0, 1000.0);
        let mut left = vec![1.0; 48000];
        let mut right: Vec<f32> = (0..48000)
            .map(|i| if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        lp.process(&mut left, &mut right);

        assert!((left[47999] - 1.0).abs() < 1e-4);
        let avg = right[24000..].iter().map(|s| s.abs()).sum::<f32>() / 24000.0;
        assert!(avg < 0.1, "nyquist should be attenuated, avg = {avg}");
    }

    #[test]
    fn test_compressor_reduces_loud_signal() {
        let mut comp = Compressor::new(
            44100.0,
            -24.0,
            12.0,
            Duration::from_millis(3),
            Duration::from_millis(250),
        );
        let mut left = vec![1.0; 44100];
        let mut right = vec![1.0; 44100];
        comp.process(&mut left, &mut right);

        // 24 dB over threshold at 12:1 settles 22 dB down.
        let settled = 20.0 * left[44099].log10();
        assert!((settled + 22.0).abs() < 0.5, "settled at {settled} dB");
        assert_eq!(left[44099], right[44099]);

        let mut quiet = Compressor::new(
            44100.0,
            -24.0,
            12.0,
            Duration::from_millis(3),
            Duration::from_millis(250),
        );
        let mut left = vec![0.001; 4410];
        let mut right = vec![0.001; 4410];
        quiet.process(&mut left, &mut right);
        assert!((left[4409] - 0.001).abs() < 1e-6);
    }

    #[test]
    fn test_feedback_delay_repeats() {
        let mut delay = FeedbackDelay::new(1000.0, Duration::from_millis(10), 0.5, 1.0);
        let (mut left, mut right) = impulse(40);
        delay.process(&mut left, &mut right);

        assert_eq!(left[0], 0.0);
        assert_eq!(left[10], 1.0);
        assert_eq!(left[20], 0.5);
        assert_eq!(left[30], 0.25);
        assert_eq!(right[10], 1.0);
    }

    #[test]
    fn test_feedback_delay_dry_mix() {
        let mut delay = FeedbackDelay::new(1000.0, Duration::from_millis(10), 0.3, 0.2);
        let (mut left, mut right) = impulse(20);
        delay.process(&mut left, &mut right);
        assert!((left[0] - 0.8).abs() < 1e-6);
        assert!((left[10] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_reverb_tail_decays() {
        let mut reverb = Reverb::new(44100.0, 0.6, 3000.0, 1.0);
        let (mut left, mut right) = impulse(44100 * 2);
        reverb.process(&mut left, &mut right);

        // Fully wet: nothing comes out before the shortest path.
        assert_eq!(left[0], 0.0);
        let energy = |s: &[f32]| s.iter().map(|x| x * x).sum::<f32>();
        let early = energy(&left[..22050]);
        let late = energy(&left[66150..]);
        assert!(early > 0.0);
        assert!(late < early * 0.01, "early {early}, late {late}");
        assert!(energy(&right[..22050]) > 0.0);
    }
}
