use super::{role_header, FULL_STOP, HALF_STOP};
use crate::error::{Result, RunnerError};

/// Client-side options that decide what a request body looks like before
/// it is framed and sent (`--in`, `--out`, `--bang`, `--debang`).
#[derive(Debug, Clone, Default)]
pub struct RequestShape {
    pub in_role: Option<String>,
    pub out_role: Option<String>,
    pub bang: Option<String>,
    pub debang: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapedRequest {
    /// Exact text to frame and send.
    pub wire: String,
    /// What the client records locally; equals `wire` unless `debang` dropped the bang-line.
    pub transcript: String,
    pub is_command: bool,
}

impl RequestShape {
    pub fn shape(&self, raw: &str) -> Result<ShapedRequest> {
        let is_command = raw.starts_with('/');
        let prefix = self
            .bang
            .as_ref()
            .map(|b| format!("{}\n", b))
            .unwrap_or_default();

        let body = if is_command {
            raw.to_string()
        } else {
            prompt_body(raw, self.in_role.as_deref(), self.out_role.as_deref())?
        };

        let wire = format!("{}{}", prefix, body);
        let transcript = if self.debang { body } else { wire.clone() };

        Ok(ShapedRequest {
            wire,
            transcript,
            is_command,
        })
    }
}

/// Wraps `raw` in the turn template.
///
/// - in + out: `IN: raw` + full stop + `OUT: ` (model writes the OUT turn)
/// - in only:  `IN: raw` + half stop (model only closes the turn)
/// - neither:  `raw` as is
pub fn prompt_body(raw: &str, in_role: Option<&str>, out_role: Option<&str>) -> Result<String> {
    match (in_role, out_role) {
        (None, None) => Ok(raw.to_string()),
        (None, Some(_)) => Err(RunnerError::protocol("--out requires --in")),
        (Some(input), Some(output)) => Ok(format!(
            "{}{}{}{}",
            role_header(input),
            raw,
            FULL_STOP,
            role_header(output)
        )),
        (Some(input), None) => Ok(format!("{}{}{}", role_header(input), raw, HALF_STOP)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_templates() {
        assert_eq!(prompt_body("hi", None, None).unwrap(), "hi");
        assert_eq!(
            prompt_body("hi", Some("USER"), Some("INTERFACE")).unwrap(),
            "USER: hi\n\n~~~(end)~~~\n\nINTERFACE: "
        );
        assert_eq!(prompt_body("hi", Some("USER"), None).unwrap(), "USER: hi\n\n~~~(");
        assert!(prompt_body("hi", None, Some("INTERFACE")).is_err());
    }

    #[test]
    fn test_bang_and_debang() {
        let shape = RequestShape {
            in_role: Some("USER".into()),
            out_role: Some("BOT".into()),
            bang: Some("!blank coder session1".into()),
            debang: true,
        };
        let shaped = shape.shape("Hello").unwrap();

        assert_eq!(shaped.wire, "!blank coder session1\nUSER: Hello\n\n~~~(end)~~~\n\nBOT: ");
        assert_eq!(shaped.transcript, "USER: Hello\n\n~~~(end)~~~\n\nBOT: ");
        assert!(!shaped.is_command);
    }

    #[test]
    fn test_commands_are_not_templated() {
        let shape = RequestShape {
            in_role: Some("USER".into()),
            bang: Some("!blank".into()),
            ..Default::default()
        };
        let shaped = shape.shape("/t 0.5").unwrap();
        assert_eq!(shaped.wire, "!blank\n/t 0.5");
        assert!(shaped.is_command);
    }
}
