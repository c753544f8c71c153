use std::collections::HashMap;
use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::core::TokenId;
use crate::error::{Result, RunnerError};

pub const DEFAULT_TEMPERATURE: f32 = 0.70;
pub const DEFAULT_TOP_P: f32 = 0.95;
pub const DEFAULT_TOP_K: u32 = 40;
pub const DEFAULT_MIN_P: f32 = 0.0;
pub const DEFAULT_FREQUENCY_PENALTY: f32 = 0.20;
pub const DEFAULT_PRESENCE_PENALTY: f32 = 0.10;
pub const DEFAULT_REPEAT_PENALTY: f32 = 1.10;

/// How many trailing tokens the penalties look at.
pub const PENALTY_WINDOW: usize = 64;

/// The active decoding knobs. Stored on disk as a small JSON object whose
/// keys match the slash-command names (`temp`, `top_p`, `pen_rep`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingSettings {
    #[serde(rename = "temp")]
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub min_p: f32,
    #[serde(rename = "pen_freq")]
    pub frequency_penalty: f32,
    #[serde(rename = "pen_pres")]
    pub presence_penalty: f32,
    #[serde(rename = "pen_rep")]
    pub repeat_penalty: f32,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            top_k: DEFAULT_TOP_K,
            min_p: DEFAULT_MIN_P,
            frequency_penalty: DEFAULT_FREQUENCY_PENALTY,
            presence_penalty: DEFAULT_PRESENCE_PENALTY,
            repeat_penalty: DEFAULT_REPEAT_PENALTY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Knob {
    Temperature,
    TopP,
    TopK,
    MinP,
    FrequencyPenalty,
    PresencePenalty,
    RepeatPenalty,
}

impl Knob {
    pub const ALL: [Knob; 7] = [
        Knob::Temperature,
        Knob::TopP,
        Knob::TopK,
        Knob::MinP,
        Knob::FrequencyPenalty,
        Knob::PresencePenalty,
        Knob::RepeatPenalty,
    ];

    /// Maps a slash-command name (without the slash) to its knob.
    pub fn from_command(name: &str) -> Option<Self> {
        match name {
            "t" => Some(Knob::Temperature),
            "p" => Some(Knob::TopP),
            "k" => Some(Knob::TopK),
            "min_p" => Some(Knob::MinP),
            "pen_freq" => Some(Knob::FrequencyPenalty),
            "pen_pres" => Some(Knob::PresencePenalty),
            "pen_rep" => Some(Knob::RepeatPenalty),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Knob::Temperature => "temp",
            Knob::TopP => "top_p",
            Knob::TopK => "top_k",
            Knob::MinP => "min_p",
            Knob::FrequencyPenalty => "pen_freq",
            Knob::PresencePenalty => "pen_pres",
            Knob::RepeatPenalty => "pen_rep",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KnobValue {
    Float(f32),
    Int(u32),
}

impl fmt::Display for KnobValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KnobValue::Float(v) => write!(f, "{}", v),
            KnobValue::Int(v) => write!(f, "{}", v),
        }
    }
}

impl SamplingSettings {
    pub fn get(&self, knob: Knob) -> KnobValue {
        match knob {
            Knob::Temperature => KnobValue::Float(self.temperature),
            Knob::TopP => KnobValue::Float(self.top_p),
            Knob::TopK => KnobValue::Int(self.top_k),
            Knob::MinP => KnobValue::Float(self.min_p),
            Knob::FrequencyPenalty => KnobValue::Float(self.frequency_penalty),
            Knob::PresencePenalty => KnobValue::Float(self.presence_penalty),
            Knob::RepeatPenalty => KnobValue::Float(self.repeat_penalty),
        }
    }

    /// Parses `raw` for `knob`, stores it, and returns the stored value.
    /// On a parse or range error the settings are left untouched.
    pub fn set(&mut self, knob: Knob, raw: &str) -> Result<KnobValue> {
        let raw = raw.trim();

        if knob == Knob::TopK {
            let v: u32 = raw
                .parse()
                .map_err(|_| RunnerError::protocol(format!("{} expects a non-negative integer, got {:?}", knob.label(), raw)))?;
            self.top_k = v;
            return Ok(KnobValue::Int(v));
        }

        let v: f32 = raw
            .parse()
            .ok()
            .filter(|v: &f32| v.is_finite())
            .ok_or_else(|| RunnerError::protocol(format!("{} expects a number, got {:?}", knob.label(), raw)))?;

        let in_range = match knob {
            Knob::TopP | Knob::MinP => (0.0..=1.0).contains(&v),
            Knob::Temperature | Knob::RepeatPenalty => v >= 0.0,
            _ => true,
        };
        if !in_range {
            return Err(RunnerError::protocol(format!("{} out of range: {}", knob.label(), v)));
        }

        match knob {
            Knob::Temperature => self.temperature = v,
            Knob::TopP => self.top_p = v,
            Knob::MinP => self.min_p = v,
            Knob::FrequencyPenalty => self.frequency_penalty = v,
            Knob::PresencePenalty => self.presence_penalty = v,
            Knob::RepeatPenalty => self.repeat_penalty = v,
            Knob::TopK => unreachable!("handled above"),
        }
        Ok(KnobValue::Float(v))
    }

    pub fn to_blob(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| RunnerError::protocol(e.to_string()))
    }

    /// Missing keys fall back to their defaults.
    pub fn from_blob(bytes: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Aligned `name = value` table used by the help text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for knob in Knob::ALL {
            let line = match self.get(knob) {
                KnobValue::Float(v) => format!("  {:<10} = {:.3}\n", knob.label(), v),
                KnobValue::Int(v) => format!("  {:<10} = {}\n", knob.label(), v),
            };
            out.push_str(&line);
        }
        out
    }
}

pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Picks the next token. `history` is the prompt plus everything
    /// generated so far in this turn; only its tail feeds the penalties.
    pub fn sample(&mut self, logits: &[f32], history: &[TokenId], settings: &SamplingSettings) -> TokenId {
        let mut candidates: Vec<(usize, f32)> = logits.iter().copied().enumerate().collect();

        apply_penalties(&mut candidates, history, settings);

        if settings.temperature <= 0.0 || candidates.len() <= 1 {
            return TokenId(argmax(&candidates) as u32);
        }

        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

        if settings.top_k > 0 {
            candidates.truncate(settings.top_k as usize);
        }

        // Softmax over the survivors, sorted descending.
        let max = candidates[0].1;
        let mut probs: Vec<(usize, f32)> = candidates
            .iter()
            .map(|&(i, l)| (i, ((l - max) / settings.temperature).exp()))
            .collect();
        normalize(&mut probs);

        if settings.top_p < 1.0 {
            let mut cumulative = 0.0;
            let mut keep = probs.len();
            for (n, (_, p)) in probs.iter().enumerate() {
                cumulative += p;
                if cumulative >= settings.top_p {
                    keep = n + 1;
                    break;
                }
            }
            probs.truncate(keep.max(1));
        }

        if settings.min_p > 0.0 {
            let threshold = probs[0].1 * settings.min_p;
            probs.retain(|&(_, p)| p >= threshold);
        }

        normalize(&mut probs);

        let r: f32 = self.rng.gen();
        let mut cumulative = 0.0;
        for &(i, p) in &probs {
            cumulative += p;
            if cumulative >= r {
                return TokenId(i as u32);
            }
        }

        TokenId(probs.last().map(|(i, _)| *i).unwrap_or(0) as u32)
    }
}

fn apply_penalties(candidates: &mut [(usize, f32)], history: &[TokenId], settings: &SamplingSettings) {
    let window = &history[history.len().saturating_sub(PENALTY_WINDOW)..];
    if window.is_empty() {
        return;
    }

    let mut counts: HashMap<usize, u32> = HashMap::new();
    for t in window {
        *counts.entry(t.0 as usize).or_insert(0) += 1;
    }

    for (i, logit) in candidates.iter_mut() {
        let Some(&count) = counts.get(i) else {
            continue;
        };
        if settings.repeat_penalty > 0.0 && settings.repeat_penalty != 1.0 {
            if *logit > 0.0 {
                *logit /= settings.repeat_penalty;
            } else {
                *logit *= settings.repeat_penalty;
            }
        }
        *logit -= count as f32 * settings.frequency_penalty + settings.presence_penalty;
    }
}

fn argmax(candidates: &[(usize, f32)]) -> usize {
    candidates
        .iter()
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| *i)
        .unwrap_or(0)
}

fn normalize(probs: &mut [(usize, f32)]) {
    let sum: f32 = probs.iter().map(|(_, p)| p).sum();
    if sum > 0.0 {
        for (_, p) in probs.iter_mut() {
            *p /= sum;
        }
    }
}
