//! The single live model session.
//!
//! A `Session` owns the active model state and sampling settings. Every
//! request runs to completion through `&mut self`, so the bang-line load,
//! the generation and the post-save of one request can never interleave
//! with another's; the server keeps exactly one `Session` on one worker.

pub mod turn;

use std::time::Instant;

use crate::checkpoint::CheckpointStore;
use crate::core::Model;
use crate::error::{Result, RunnerError};
use crate::format::{human_bytes, human_duration};
use crate::protocol::{BangDirective, Body, Request, SlashCommand};
use crate::sample::{Sampler, SamplingSettings};

pub use turn::{ForceReason, Offer, Phase, Stop, TurnLimits, TurnOutcome, TurnStopDetector};

const HELP: &str = "\
commands:
  /save [name]      save model state (default kv)
  /load [name]      load model state (default kv)
  /save_set [name]  save sampling settings (default set)
  /load_set [name]  load sampling settings (default set)
  /t /p /k /min_p /pen_freq /pen_pres /pen_rep [value]
                    get or set a sampling knob
  /max [n]          get or set the per-turn token budget
  /?                this help
bang-line (first line of a request):
  !load [settings|- [save]]
";

#[derive(Debug)]
pub enum Reply {
    /// Command acknowledgement or value.
    Ack(String),
    Turn(TurnOutcome),
}

impl Reply {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Reply::Ack(text) => text.into_bytes(),
            Reply::Turn(outcome) => outcome.text,
        }
    }
}

pub struct Session<M: Model> {
    model: M,
    state: M::State,
    settings: SamplingSettings,
    sampler: Sampler,
    store: CheckpointStore,
    limits: TurnLimits,
    phase: Phase,
}

impl<M: Model> Session<M> {
    pub fn new(model: M, store: CheckpointStore, limits: TurnLimits, seed: u64) -> Self {
        let state = model.initial_state();
        Self {
            model,
            state,
            settings: SamplingSettings::default(),
            sampler: Sampler::new(seed),
            store,
            limits,
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn settings(&self) -> &SamplingSettings {
        &self.settings
    }

    pub fn limits(&self) -> &TurnLimits {
        &self.limits
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Serialized form of the active model state.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        self.model.serialize(&self.state)
    }

    /// Runs one raw request frame and returns the reply frame body.
    /// Errors are rendered into the reply; nothing here can fail the caller.
    pub fn handle(&mut self, raw: &[u8]) -> Vec<u8> {
        if raw.is_empty() {
            return Vec::new();
        }

        match Request::from_bytes(raw).and_then(|request| self.execute(request)) {
            Ok(reply) => reply.into_bytes(),
            Err(e) => {
                tracing::warn!("request failed: {}", e);
                e.to_response().into_bytes()
            }
        }
    }

    pub fn execute(&mut self, request: Request) -> Result<Reply> {
        tracing::debug!("executing {:?}", request);
        let mut phases = vec![self.phase];
        let result = self.execute_in_phases(request, &mut phases);
        self.enter(Phase::Idle, &mut phases);

        result.map(|reply| match reply {
            Reply::Turn(mut outcome) => {
                outcome.phases = phases;
                Reply::Turn(outcome)
            }
            ack => ack,
        })
    }

    fn execute_in_phases(&mut self, request: Request, phases: &mut Vec<Phase>) -> Result<Reply> {
        let Request { bang, body } = request;

        // What the session looked like before the bang, restored if the body fails.
        let rollback = bang.as_ref().map(|_| (self.state.clone(), self.settings));

        let mut acks = String::new();
        if let Some(bang) = &bang {
            self.enter(Phase::Loading, phases);
            self.apply_bang(bang)?;
            acks.push_str(&format!("[loaded <- {}]\n", bang.load));
            if let Some(name) = &bang.settings {
                acks.push_str(&format!("[loaded set <- {}]\n", name));
            }
        }

        // A bang-line with nothing after it only copies the checkpoint.
        let copy_only = bang.is_some() && matches!(&body, Body::Prompt(p) if p.is_empty());
        let executed = match body {
            Body::Command(command) => self.dispatch(command).map(Reply::Ack),
            Body::Prompt(_) if copy_only => Ok(Reply::Ack(acks)),
            Body::Prompt(prompt) => self.run_turn(&prompt, phases).map(Reply::Turn),
        };
        let mut reply = match executed {
            Ok(reply) => reply,
            Err(e) => {
                if let Some((state, settings)) = rollback {
                    self.state = state;
                    self.settings = settings;
                }
                return Err(e);
            }
        };

        if let Some(name) = bang.as_ref().and_then(|b| b.save.as_deref()) {
            let size = self.save_state(name)?;
            if let (true, Reply::Ack(text)) = (copy_only, &mut reply) {
                text.push_str(&format!("[saved -> {} ({})]\n", name, human_bytes(size)));
            }
        }
        Ok(reply)
    }

    fn enter(&mut self, phase: Phase, phases: &mut Vec<Phase>) {
        tracing::debug!("session {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
        phases.push(phase);
    }

    /// Loads everything the directive names before touching the session,
    /// so a missing settings file leaves the old state in place too.
    fn apply_bang(&mut self, bang: &BangDirective) -> Result<()> {
        let state = self.read_state(&bang.load)?;
        let settings = match &bang.settings {
            Some(name) => Some(self.read_settings(name)?),
            None => None,
        };

        self.state = state;
        if let Some(settings) = settings {
            self.settings = settings;
        }
        Ok(())
    }

    fn read_state(&self, name: &str) -> Result<M::State> {
        let blob = self.store.load_state(name)?;
        self.model
            .deserialize(&blob)
            .map_err(|e| RunnerError::CheckpointRead {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }

    fn read_settings(&self, name: &str) -> Result<SamplingSettings> {
        let blob = self.store.load_settings(name)?;
        SamplingSettings::from_blob(&blob).map_err(|e| RunnerError::CheckpointRead {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    fn save_state(&self, name: &str) -> Result<u64> {
        let blob = self.model.serialize(&self.state)?;
        self.store.save_state(name, &blob)
    }

    fn dispatch(&mut self, command: SlashCommand) -> Result<String> {
        match command {
            SlashCommand::Save(name) => {
                let size = self.save_state(&name)?;
                Ok(format!("[saved -> {} ({})]\n", name, human_bytes(size)))
            }
            SlashCommand::Load(name) => {
                self.state = self.read_state(&name)?;
                Ok(format!("[loaded <- {}]\n", name))
            }
            SlashCommand::SaveSettings(name) => {
                let size = self.store.save_settings(&name, &self.settings.to_blob()?)?;
                Ok(format!("[saved set -> {} ({})]\n", name, human_bytes(size)))
            }
            SlashCommand::LoadSettings(name) => {
                self.settings = self.read_settings(&name)?;
                Ok(format!("[loaded set <- {}]\n", name))
            }
            SlashCommand::Knob { knob, value: None } => Ok(self.settings.get(knob).to_string()),
            SlashCommand::Knob { knob, value: Some(raw) } => Ok(self.settings.set(knob, &raw)?.to_string()),
            SlashCommand::MaxTokens(None) => Ok(self.limits.max_tokens.to_string()),
            SlashCommand::MaxTokens(Some(raw)) => {
                let n: usize = raw
                    .parse()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| RunnerError::protocol(format!("max expects a positive integer, got {:?}", raw)))?;
                self.limits.max_tokens = n;
                Ok(n.to_string())
            }
            SlashCommand::Help => Ok(format!(
                "{}settings:\n{}limits:\n  max_tokens = {}\n  max_time   = {}\n",
                HELP,
                self.settings.render(),
                self.limits.max_tokens,
                human_duration(self.limits.max_time)
            )),
        }
    }

    fn run_turn(&mut self, prompt: &str, phases: &mut Vec<Phase>) -> Result<TurnOutcome> {
        let started = Instant::now();
        let before = self.state.clone();
        self.enter(Phase::Generating, phases);

        let generated = turn::generate(
            &mut self.model,
            &mut self.state,
            &mut self.sampler,
            &self.settings,
            prompt,
            &self.limits,
        );
        let (text, stop, generated_tokens) = match generated {
            Ok(done) => done,
            Err(e) => {
                self.state = before;
                return Err(e);
            }
        };

        self.enter(stop.phase(), phases);
        let elapsed = started.elapsed();
        tracing::info!(
            "turn finished: {:?}, {} tokens in {}",
            stop,
            generated_tokens,
            human_duration(elapsed)
        );

        Ok(TurnOutcome {
            text,
            stop,
            generated_tokens,
            elapsed,
            phases: Vec::new(),
        })
    }
}
