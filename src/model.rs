//! Shared data types for the AVR session core: zones, tuner bands, command
//! items and the scalar value type used by arguments and parameters.

use std::fmt;

/// A logically independent output of the AVR.
///
/// `All` is a pseudo-zone used only as a broadcast target for operations like
/// `refresh`; it never appears as a key in the property cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Zone {
    Main,
    Z2,
    Z3,
    HdZone,
    All,
}

impl Zone {
    /// Single-character wire code used in command templates.
    pub fn wire_code(self) -> &'static str {
        match self {
            Zone::Main => "1",
            Zone::Z2 => "2",
            Zone::Z3 => "3",
            Zone::HdZone => "Z",
            Zone::All => "",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Zone::Main => "Main",
            Zone::Z2 => "Zone 2",
            Zone::Z3 => "Zone 3",
            Zone::HdZone => "HD Zone",
            Zone::All => "All",
        }
    }

    /// The four addressable zones, in wire-code order. Excludes `All`.
    pub fn addressable() -> [Zone; 4] {
        [Zone::Main, Zone::Z2, Zone::Z3, Zone::HdZone]
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Tuner band, used by `set_tuner_frequency` and the tuner topic map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunerBand {
    Am,
    Fm,
}

/// A scalar argument or parameter value. Commands and parameters both carry
/// small heterogeneous payloads, so a single closed enum is used for both
/// rather than a generic type parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Zone(Zone),
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl From<Zone> for Scalar {
    fn from(z: Zone) -> Self {
        Scalar::Zone(z)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Str(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Str(v.to_string())
    }
}

/// Tri-state boolean: explicit true/false, or left to the queue's default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tristate {
    True,
    False,
    #[default]
    Unspecified,
}

impl Tristate {
    pub fn resolve(self, default: bool) -> bool {
        match self {
            Tristate::True => true,
            Tristate::False => false,
            Tristate::Unspecified => default,
        }
    }
}

impl From<bool> for Tristate {
    fn from(v: bool) -> Self {
        if v {
            Tristate::True
        } else {
            Tristate::False
        }
    }
}

/// An intent to act: either an AVR command mnemonic or a local pseudo-command
/// beginning with `_`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandItem {
    pub name: String,
    pub args: Vec<Scalar>,
    pub queue_id: i32,
    pub insert_at: Option<i32>,
    pub skip_if_starting: Tristate,
    pub skip_if_queued: Tristate,
    pub skip_if_refreshing: Tristate,
}

impl CommandItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            queue_id: 0,
            insert_at: None,
            skip_if_starting: Tristate::Unspecified,
            skip_if_queued: Tristate::Unspecified,
            skip_if_refreshing: Tristate::Unspecified,
        }
    }

    pub fn with_args(mut self, args: Vec<Scalar>) -> Self {
        self.args = args;
        self
    }

    pub fn with_queue(mut self, queue_id: i32) -> Self {
        self.queue_id = queue_id;
        self
    }

    pub fn is_local(&self) -> bool {
        self.name.starts_with('_')
    }

    /// Dedup key: `(name, args)`, ignoring placement flags.
    fn dedup_key(&self) -> (&str, &[Scalar]) {
        (self.name.as_str(), self.args.as_slice())
    }

    pub fn dedup_eq(&self, other: &CommandItem) -> bool {
        self.dedup_key() == other.dedup_key()
    }
}
