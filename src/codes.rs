//! C3: the command/decoder registry.
//!
//! Two read-only tables: command mnemonic -> wire template/response prefix,
//! and response prefix -> decoder. Actual command definitions and decoder
//! bodies are an external concern (the per-command code table and
//! per-response decoders named out of scope); this module only provides the
//! registry abstraction, the placeholder-substitution template expander,
//! and the longest-prefix matcher that the responder and command queue
//! drive.

use std::sync::Arc;

use crate::error::AvrError;
use crate::model::{Scalar, Zone};
use crate::params::Parameters;
use crate::properties::Properties;

/// Per-command behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFlags {
    pub rate_limited: bool,
    pub fire_and_forget: bool,
}

impl Default for CommandFlags {
    fn default() -> Self {
        Self {
            rate_limited: true,
            fire_and_forget: false,
        }
    }
}

/// Which zones a command mnemonic is valid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneScope {
    Specific(Zone),
    AnyZone,
    Global,
}

/// One entry in the command table: mnemonic -> wire behavior.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub wire_template: String,
    pub expected_response_prefix: Option<String>,
    pub zone_scope: ZoneScope,
    pub flags: CommandFlags,
}

impl CommandSpec {
    pub fn new(wire_template: impl Into<String>) -> Self {
        Self {
            wire_template: wire_template.into(),
            expected_response_prefix: None,
            zone_scope: ZoneScope::Global,
            flags: CommandFlags::default(),
        }
    }

    pub fn with_response_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.expected_response_prefix = Some(prefix.into());
        self
    }

    pub fn with_zone_scope(mut self, scope: ZoneScope) -> Self {
        self.zone_scope = scope;
        self
    }

    pub fn fire_and_forget(mut self) -> Self {
        self.flags.fire_and_forget = true;
        self.expected_response_prefix = None;
        self
    }

    /// Opts this command out of `command_delay` pacing. Used for mnemonics
    /// the AVR accepts back-to-back (e.g. repeated step commands some
    /// models tolerate at full rate).
    pub fn rate_unlimited(mut self) -> Self {
        self.flags.rate_limited = false;
        self
    }

    /// Expand `{z}` (zone wire code) and `{0}`, `{1}`, ... (positional args)
    /// placeholders into the literal wire bytes (without the trailing
    /// `\r\n`, which C4 appends).
    pub fn render(&self, zone: Zone, args: &[Scalar]) -> Result<String, AvrError> {
        let mut out = self.wire_template.replace("{z}", zone.wire_code());
        for (i, arg) in args.iter().enumerate() {
            let token = render_scalar(arg);
            out = out.replace(&format!("{{{}}}", i), &token);
        }
        if out.contains('{') {
            return Err(AvrError::Validation(format!(
                "unfilled placeholder in wire template for '{}'",
                self.wire_template
            )));
        }
        Ok(out)
    }
}

fn render_scalar(s: &Scalar) -> String {
    match s {
        Scalar::Zone(z) => z.wire_code().to_string(),
        Scalar::Int(v) => v.to_string(),
        Scalar::Float(v) => format!("{:.2}", v),
        Scalar::Str(v) => v.clone(),
        Scalar::Bool(v) => if *v { "1" } else { "0" }.to_string(),
    }
}

/// A decoder consumes the suffix of a matched response line and the shared
/// cache/parameters, and reports which zones it touched so observers can be
/// notified. Registered as a trait object so the embedding application can
/// supply closures or structs without the core depending on their types.
pub trait Decoder: Send + Sync {
    fn decode(&self, rest_of_line: &str, props: &Properties, params: &Parameters) -> Vec<Zone>;
}

impl<F> Decoder for F
where
    F: Fn(&str, &Properties, &Parameters) -> Vec<Zone> + Send + Sync,
{
    fn decode(&self, rest_of_line: &str, props: &Properties, params: &Parameters) -> Vec<Zone> {
        (self)(rest_of_line, props, params)
    }
}

struct DecoderEntry {
    prefix: String,
    decoder: Arc<dyn Decoder>,
}

/// The read-only command/decoder registry (C3).
pub struct CodeRegistry {
    commands: std::collections::HashMap<String, CommandSpec>,
    /// Decoders in registration order; longest-prefix match wins, ties
    /// break by registration order (earlier registration wins), per §4.3.
    decoders: Vec<DecoderEntry>,
}

impl CodeRegistry {
    pub fn new() -> Self {
        Self {
            commands: std::collections::HashMap::new(),
            decoders: Vec::new(),
        }
    }

    pub fn register_command(&mut self, name: impl Into<String>, spec: CommandSpec) {
        self.commands.insert(name.into(), spec);
    }

    pub fn lookup_command(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }

    pub fn register_decoder(&mut self, prefix: impl Into<String>, decoder: impl Decoder + 'static) {
        self.decoders.push(DecoderEntry {
            prefix: prefix.into(),
            decoder: Arc::new(decoder),
        });
    }

    /// Longest-prefix match over the decoder table. Returns the matched
    /// entry's decoder and the suffix of `line` after the prefix.
    pub fn find_decoder<'a>(&self, line: &'a str) -> Option<(Arc<dyn Decoder>, &'a str)> {
        let mut best: Option<(usize, usize)> = None; // (prefix len, index)
        for (idx, entry) in self.decoders.iter().enumerate() {
            if line.starts_with(entry.prefix.as_str()) {
                let better = match best {
                    None => true,
                    Some((best_len, best_idx)) => {
                        entry.prefix.len() > best_len
                            || (entry.prefix.len() == best_len && idx < best_idx)
                    }
                };
                if better {
                    best = Some((entry.prefix.len(), idx));
                }
            }
        }
        best.map(|(len, idx)| (self.decoders[idx].decoder.clone(), &line[len..]))
    }
}

impl Default for CodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeRegistry {
    /// Sanity-checks the registered command table before a session starts:
    /// every non-fire-and-forget command must declare an expected response
    /// prefix, and no wire template may be empty. This is internal
    /// construction-time glue (no public error taxonomy is exposed here),
    /// so it builds on `anyhow` rather than [`crate::error::AvrError`];
    /// [`crate::facade::Facade::connect`] converts failures to
    /// [`crate::error::AvrError::Validation`] at the public boundary.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, spec) in &self.commands {
            if spec.wire_template.is_empty() {
                anyhow::bail!("command '{}' has an empty wire template", name);
            }
            if !spec.flags.fire_and_forget && spec.expected_response_prefix.is_none() {
                anyhow::bail!(
                    "command '{}' expects a response but declares no response prefix",
                    name
                );
            }
        }
        Ok(())
    }
}

/// Shared handle used by every module downstream of construction: `Facade`
/// populates it via [`SharedRegistry::register_command`]/`register_decoder`
/// any time before `connect`, while C4/C5/C6 only ever read through it.
pub type SharedRegistry = Arc<std::sync::RwLock<CodeRegistry>>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_zone_and_args() {
        let spec = CommandSpec::new("{0}VL{z}").with_response_prefix("VOL");
        let out = spec.render(Zone::Z2, &[Scalar::Int(50)]).unwrap();
        assert_eq!(out, "50VL2");
    }

    #[test]
    fn render_fails_on_unfilled_placeholder() {
        let spec = CommandSpec::new("{0}{1}VL{z}");
        let err = spec.render(Zone::Main, &[Scalar::Int(50)]).unwrap_err();
        assert!(matches!(err, AvrError::Validation(_)));
    }

    #[test]
    fn validate_rejects_command_with_no_response_prefix() {
        let mut reg = CodeRegistry::new();
        reg.register_command("PWR_ON", CommandSpec::new("PO{z}"));
        assert!(reg.validate().is_err());
    }

    #[test]
    fn validate_allows_fire_and_forget_without_prefix() {
        let mut reg = CodeRegistry::new();
        reg.register_command("PWR_ON", CommandSpec::new("PO{z}").fire_and_forget());
        assert!(reg.validate().is_ok());
    }

    #[test]
    fn longest_prefix_wins() {
        let mut reg = CodeRegistry::new();
        reg.register_decoder("VOL", |_rest: &str, _p: &Properties, _pa: &Parameters| vec![Zone::Main]);
        reg.register_decoder("VOL2", |_rest: &str, _p: &Properties, _pa: &Parameters| vec![Zone::Z2]);
        let (decoder, rest) = reg.find_decoder("VOL2050").unwrap();
        let props = Properties::new();
        let params = Parameters::new();
        assert_eq!(decoder.decode(rest, &props, &params), vec![Zone::Z2]);
    }

    #[test]
    fn ties_break_by_registration_order() {
        let mut reg = CodeRegistry::new();
        reg.register_decoder("VOL", |_rest: &str, _p: &Properties, _pa: &Parameters| vec![Zone::Main]);
        reg.register_decoder("VOL", |_rest: &str, _p: &Properties, _pa: &Parameters| vec![Zone::Z2]);
        let (decoder, _rest) = reg.find_decoder("VOL050").unwrap();
        let props = Properties::new();
        let params = Parameters::new();
        assert_eq!(decoder.decode("", &props, &params), vec![Zone::Main]);
    }
}
