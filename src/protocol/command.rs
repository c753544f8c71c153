use crate::checkpoint::{CheckpointStore, DEFAULT_SETTINGS_NAME, DEFAULT_STATE_NAME};
use crate::error::{Result, RunnerError};
use crate::sample::Knob;

/// Settings slot in a bang-line meaning "keep the active settings".
pub const CURRENT_SETTINGS: &str = "-";

/// `!load [settings [save]]` on the first line of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BangDirective {
    pub load: String,
    pub settings: Option<String>,
    pub save: Option<String>,
}

impl BangDirective {
    /// Parses a single line that starts with `!`.
    pub fn parse(line: &str) -> Result<Self> {
        let rest = line
            .strip_prefix('!')
            .ok_or_else(|| RunnerError::protocol("bang-line must start with '!'"))?;
        let names: Vec<&str> = rest.split_whitespace().collect();

        let (load, settings, save) = match names.as_slice() {
            [] => return Err(RunnerError::protocol("bang-line requires a checkpoint to load")),
            [load] => (*load, None, None),
            [load, settings] => (*load, Some(*settings), None),
            [load, settings, save] => (*load, Some(*settings), Some(*save)),
            _ => {
                return Err(RunnerError::protocol(format!(
                    "bang-line takes at most 3 names, got {}",
                    names.len()
                )))
            }
        };

        CheckpointStore::validate_name(load)?;
        let settings = settings.filter(|s| *s != CURRENT_SETTINGS);
        if let Some(name) = settings {
            CheckpointStore::validate_name(name)?;
        }
        if let Some(name) = save {
            CheckpointStore::validate_name(name)?;
        }

        Ok(Self {
            load: load.to_string(),
            settings: settings.map(str::to_string),
            save: save.map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SlashCommand {
    Save(String),
    Load(String),
    SaveSettings(String),
    LoadSettings(String),
    /// Get (`value == None`) or set one sampling knob.
    Knob { knob: Knob, value: Option<String> },
    /// Get or set the per-turn token budget.
    MaxTokens(Option<String>),
    Help,
}

impl SlashCommand {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (head, arg) = match text.split_once(char::is_whitespace) {
            Some((head, arg)) => (head, arg.trim()),
            None => (text, ""),
        };
        let head = head.to_lowercase();
        let name = head
            .strip_prefix('/')
            .ok_or_else(|| RunnerError::protocol("slash-command must start with '/'"))?;
        let arg = (!arg.is_empty()).then(|| arg.to_string());

        let command = match name {
            "save" => SlashCommand::Save(checkpoint_name(arg.as_deref(), DEFAULT_STATE_NAME)?),
            "load" => SlashCommand::Load(checkpoint_name(arg.as_deref(), DEFAULT_STATE_NAME)?),
            "save_set" => SlashCommand::SaveSettings(checkpoint_name(arg.as_deref(), DEFAULT_SETTINGS_NAME)?),
            "load_set" => SlashCommand::LoadSettings(checkpoint_name(arg.as_deref(), DEFAULT_SETTINGS_NAME)?),
            "max" => SlashCommand::MaxTokens(arg),
            "?" => SlashCommand::Help,
            other => match Knob::from_command(other) {
                Some(knob) => SlashCommand::Knob { knob, value: arg },
                None => return Err(RunnerError::protocol(format!("unknown command: /{}", other))),
            },
        };
        Ok(command)
    }
}

fn checkpoint_name(arg: Option<&str>, default: &str) -> Result<String> {
    let name = arg.unwrap_or(default);
    CheckpointStore::validate_name(name)?;
    Ok(name.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Command(SlashCommand),
    /// Text fed verbatim to the model, role headers and markers included.
    Prompt(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub bang: Option<BangDirective>,
    pub body: Body,
}

impl Request {
    /// Classifies one decoded frame. The bang-line, if any, is consumed
    /// as a control line and never reaches the model.
    pub fn parse(text: &str) -> Result<Self> {
        let (bang, body) = if text.starts_with('!') {
            let (line, rest) = text.split_once('\n').unwrap_or((text, ""));
            (Some(BangDirective::parse(line)?), rest)
        } else {
            (None, text)
        };

        let body = if body.trim_start().starts_with('/') {
            Body::Command(SlashCommand::parse(body)?)
        } else {
            Body::Prompt(body.to_string())
        };

        Ok(Self { bang, body })
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        Self::parse(&String::from_utf8_lossy(raw))
    }
}
