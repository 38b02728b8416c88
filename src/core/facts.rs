//! Environment facts - the read-only snapshot conditions are evaluated against
//!
//! Facts are captured once when a run starts. Steps may declare new facts by
//! printing `::set-fact name=KEY::VALUE` lines; those land in an append-only
//! [`FactLedger`] and are only visible to steps ordered after the declaring one.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use thiserror::Error;

/// Fact keys that always exist, defaulting to the empty string
pub const KNOWN_FACT_KEYS: &[&str] = &["DEPLOY", "DEPLOY_ALT", "IMAGE", "SCRIPT"];

/// Immutable snapshot of the agent environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentFacts {
    values: BTreeMap<String, String>,
}

impl EnvironmentFacts {
    pub fn from_map(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Builds the facts snapshot for a run
#[derive(Debug, Clone, Default)]
pub struct FactsProvider {
    /// Job name, `STEPLINE_JOB` wins when set
    pub job: Option<String>,

    /// Extra environment variables captured as facts
    pub fact_keys: Vec<String>,

    /// Secret names recorded by presence only
    pub secrets: Vec<String>,

    /// Static facts from the pipeline document
    pub static_facts: HashMap<String, String>,

    /// Overrides given on the command line, applied last
    pub overrides: Vec<(String, String)>,
}

impl FactsProvider {
    /// Capture facts from the process environment
    pub fn snapshot(&self) -> EnvironmentFacts {
        self.snapshot_from(|key| std::env::var(key).ok())
    }

    /// Capture facts using an arbitrary variable lookup
    pub fn snapshot_from<F>(&self, lookup: F) -> EnvironmentFacts
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut values = BTreeMap::new();

        values.insert("OS".to_string(), os_fact(std::env::consts::OS));

        let job = lookup("STEPLINE_JOB")
            .or_else(|| self.job.clone())
            .unwrap_or_default();
        values.insert("JOB".to_string(), job);

        let keys = KNOWN_FACT_KEYS
            .iter()
            .map(|k| k.to_string())
            .chain(self.fact_keys.iter().cloned());
        for key in keys {
            let value = lookup(&key).unwrap_or_default();
            values.insert(key, value);
        }

        // Presence only. The value itself never enters the snapshot.
        for secret in &self.secrets {
            let present = lookup(secret).is_some_and(|v| !v.is_empty());
            values.insert(format!("secrets.{}", secret), present.to_string());
        }

        for (key, value) in &self.static_facts {
            values.insert(key.clone(), value.clone());
        }

        for (key, value) in &self.overrides {
            values.insert(key.clone(), value.clone());
        }

        EnvironmentFacts { values }
    }
}

/// Map a Rust target OS name to the platform identifier used in conditions
pub fn os_fact(os: &str) -> String {
    match os {
        "linux" => "Linux".to_string(),
        "windows" => "Windows".to_string(),
        "macos" => "Darwin".to_string(),
        other => other.to_string(),
    }
}

/// A fact declared by a step at runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedFact {
    pub name: String,
    pub value: String,

    /// Global index of the step that declared it
    pub declared_by: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FactError {
    #[error("step {step} cannot declare facts after step {latest} already has")]
    OutOfOrder { step: usize, latest: usize },

    #[error("invalid fact name: {0:?}")]
    InvalidName(String),
}

/// Append-only ledger of the base snapshot plus runtime declarations
#[derive(Debug, Clone)]
pub struct FactLedger {
    base: EnvironmentFacts,
    derived: Vec<DerivedFact>,
}

impl FactLedger {
    pub fn new(base: EnvironmentFacts) -> Self {
        Self {
            base,
            derived: Vec::new(),
        }
    }

    pub fn base(&self) -> &EnvironmentFacts {
        &self.base
    }

    pub fn derived(&self) -> &[DerivedFact] {
        &self.derived
    }

    /// Append a fact declared by the step at `step_index`
    pub fn declare(
        &mut self,
        step_index: usize,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), FactError> {
        let name = name.into();
        if !is_valid_fact_name(&name) {
            return Err(FactError::InvalidName(name));
        }
        if let Some(last) = self.derived.last() {
            if step_index < last.declared_by {
                return Err(FactError::OutOfOrder {
                    step: step_index,
                    latest: last.declared_by,
                });
            }
        }
        self.derived.push(DerivedFact {
            name,
            value: value.into(),
            declared_by: step_index,
        });
        Ok(())
    }

    /// Facts as seen by the step at `step_index`
    pub fn view(&self, step_index: usize) -> FactView<'_> {
        FactView {
            ledger: self,
            step_index,
        }
    }
}

/// Read-only view of the ledger for one step
#[derive(Debug, Clone, Copy)]
pub struct FactView<'a> {
    ledger: &'a FactLedger,
    step_index: usize,
}

impl<'a> FactView<'a> {
    /// Look up a fact, latest visible declaration first
    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.ledger
            .derived
            .iter()
            .rev()
            .filter(|f| f.declared_by < self.step_index)
            .find(|f| f.name == key)
            .map(|f| f.value.as_str())
            .or_else(|| self.ledger.base.get(key))
    }

    /// Flatten into a variable map, derived facts shadowing the base
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map: BTreeMap<String, String> = self
            .ledger
            .base
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for fact in self
            .ledger
            .derived
            .iter()
            .filter(|f| f.declared_by < self.step_index)
        {
            map.insert(fact.name.clone(), fact.value.clone());
        }
        map
    }
}

fn is_valid_fact_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn declaration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^::set-fact name=([A-Za-z_][A-Za-z0-9_.]*)::(.*)$")
            .expect("set-fact pattern is valid")
    })
}

/// Extract `::set-fact name=KEY::VALUE` declarations from step output
pub fn parse_declarations(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let caps = declaration_regex().captures(line.trim_end_matches('\r'))?;
            Some((caps[1].to_string(), caps[2].to_string()))
        })
        .collect()
}
