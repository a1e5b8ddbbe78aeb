// src/variation.rs
//
// =============================================================================
// GRAVITATION: KERNEL VARIATIONS & CLI OPTIONS
// =============================================================================
//
// A Variation is one point in a kernel's discrete configuration space:
// dtype x target x threads, plus kernel-defined extras. Kernels declare
// their full Variations set at meta-load time; the CLI folds that set
// into per-field OptionSpecs and resolves user choices back into a
// selected Variation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::VariationError;

// ============================================================================
// 1. AXES
// ============================================================================

/// Numeric precision a kernel computes and stores in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Dtype {
    #[serde(rename = "float32")]
    Float32,
    #[serde(rename = "float64")]
    Float64,
}

impl Dtype {
    pub fn name(self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }

    /// Bytes per scalar in the on-disk little-endian encoding.
    pub fn width(self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "float32" => Some(Self::Float32),
            "float64" => Some(Self::Float64),
            _ => None,
        }
    }
}

/// Execution target of stage 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Target {
    #[serde(rename = "cpu")]
    Cpu,
    #[serde(rename = "gpu")]
    Gpu,
}

impl Target {
    pub fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "cpu" => Some(Self::Cpu),
            "gpu" => Some(Self::Gpu),
            _ => None,
        }
    }
}

/// Thread mode of a kernel. The canonical modes are auto, single,
/// physical and logical; `t1` .. `tLOGICAL` enumerate explicit counts
/// and are kept selectable for workers even though benchmark sweeps
/// skip them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Threads {
    Auto,
    Single,
    Physical,
    Logical,
    Count(usize),
}

impl Threads {
    pub fn name(self) -> String {
        match self {
            Self::Auto => "auto".into(),
            Self::Single => "single".into(),
            Self::Physical => "physical".into(),
            Self::Logical => "logical".into(),
            Self::Count(n) => format!("t{n}"),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "auto" => Some(Self::Auto),
            "single" => Some(Self::Single),
            "physical" => Some(Self::Physical),
            "logical" => Some(Self::Logical),
            _ => raw
                .strip_prefix('t')
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|n| *n >= 1)
                .map(Self::Count),
        }
    }

    /// Resolves the mode into an actual thread count on this host.
    pub fn count(self) -> usize {
        match self {
            Self::Auto | Self::Logical => num_cpus::get(),
            Self::Single => 1,
            Self::Physical => num_cpus::get_physical(),
            Self::Count(n) => n,
        }
    }

    /// All modes available on this host: the four canonical ones plus
    /// one explicit `tN` per logical core.
    pub fn enumerate() -> Vec<Self> {
        let mut modes = vec![Self::Auto, Self::Single, Self::Physical, Self::Logical];
        modes.extend((1..=num_cpus::get()).map(Self::Count));
        modes
    }
}

impl fmt::Display for Threads {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// 2. VARIATION
// ============================================================================

/// One configuration of a kernel. Immutable; identity is the canonical
/// (field name -> value) map, which is also the JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct Variation {
    dtype: Dtype,
    target: Target,
    threads: Threads,
    extras: BTreeMap<String, String>,
}

impl Variation {
    pub fn new(dtype: Dtype, target: Target, threads: Threads) -> Self {
        Self {
            dtype,
            target,
            threads,
            extras: BTreeMap::new(),
        }
    }

    /// Attaches a kernel-defined extra option.
    pub fn with_extra(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(field.into(), value.into());
        self
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn threads(&self) -> Threads {
        self.threads
    }

    pub fn extras(&self) -> &BTreeMap<String, String> {
        &self.extras
    }

    pub fn get(&self, field: &str) -> Option<String> {
        match field {
            "dtype" => Some(self.dtype.name().into()),
            "target" => Some(self.target.name().into()),
            "threads" => Some(self.threads.name()),
            _ => self.extras.get(field).cloned(),
        }
    }

    /// Canonical (field -> value) map; doubles as the JSON form and as
    /// the set-identity key.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("dtype".into(), self.dtype.name().into());
        map.insert("target".into(), self.target.name().into());
        map.insert("threads".into(), self.threads.name());
        for (field, value) in &self.extras {
            map.insert(field.clone(), value.clone());
        }
        map
    }

    /// Canonical JSON with sorted keys.
    pub fn to_json(&self) -> String {
        // BTreeMap keys serialize sorted
        serde_json::to_string(&self.to_map()).expect("string map is always valid JSON")
    }

    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self, VariationError> {
        let mut variation = Self::default();
        let mut extras = BTreeMap::new();
        for (field, value) in map {
            match field.as_str() {
                "dtype" => {
                    variation.dtype = Dtype::parse(value).ok_or_else(|| {
                        VariationError::UnknownChoice(field.clone(), value.clone())
                    })?;
                }
                "target" => {
                    variation.target = Target::parse(value).ok_or_else(|| {
                        VariationError::UnknownChoice(field.clone(), value.clone())
                    })?;
                }
                "threads" => {
                    variation.threads = Threads::parse(value).ok_or_else(|| {
                        VariationError::UnknownChoice(field.clone(), value.clone())
                    })?;
                }
                _ => {
                    extras.insert(field.clone(), value.clone());
                }
            }
        }
        variation.extras = extras;
        Ok(variation)
    }

    pub fn from_json(raw: &str) -> Result<Self, VariationError> {
        let map: BTreeMap<String, String> =
            serde_json::from_str(raw).map_err(|_| VariationError::NoMatch)?;
        Self::from_map(&map)
    }
}

impl Default for Variation {
    fn default() -> Self {
        Self::new(Dtype::Float64, Target::Cpu, Threads::Single)
    }
}

impl fmt::Display for Variation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self
            .to_map()
            .into_iter()
            .map(|(field, value)| format!("{field}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        write!(f, "<Variation {fields}>")
    }
}

impl From<Variation> for BTreeMap<String, String> {
    fn from(variation: Variation) -> Self {
        variation.to_map()
    }
}

impl TryFrom<BTreeMap<String, String>> for Variation {
    type Error = VariationError;

    fn try_from(map: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        Self::from_map(&map)
    }
}

// ============================================================================
// 3. VARIATIONS (the enumerated set)
// ============================================================================

/// All variations a kernel supports, in declaration order, with an
/// optional selection.
#[derive(Debug, Clone, Default)]
pub struct Variations {
    variations: Vec<Variation>,
    selected: Option<usize>,
}

impl Variations {
    pub fn new(variations: impl IntoIterator<Item = Variation>) -> Self {
        let mut set = Self::default();
        for variation in variations {
            set.add(variation);
        }
        set
    }

    /// Adds a variation; duplicates (by canonical map) are ignored.
    pub fn add(&mut self, variation: Variation) {
        if !self.contains(&variation) {
            self.variations.push(variation);
        }
    }

    pub fn len(&self) -> usize {
        self.variations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variation> {
        self.variations.iter()
    }

    pub fn contains(&self, variation: &Variation) -> bool {
        self.variations.iter().any(|v| v == variation)
    }

    /// Matches CLI-style (key, value) pairs against the enumerated set.
    /// Keys must name known options, values must be known choices, and
    /// at least one enumerated variation must carry every given pair;
    /// the first such variation (declaration order) becomes selected.
    pub fn select(&mut self, choices: &BTreeMap<String, String>) -> Result<&Variation, VariationError> {
        let options: BTreeMap<String, OptionSpec> = self
            .to_options()
            .into_iter()
            .map(|option| (option.name().to_string(), option))
            .collect();

        for (key, value) in choices {
            let option = options
                .get(key)
                .ok_or_else(|| VariationError::UnknownOption(key.clone()))?;
            if !option.contains(value) {
                return Err(VariationError::UnknownChoice(key.clone(), value.clone()));
            }
        }

        let index = self
            .variations
            .iter()
            .position(|variation| {
                choices
                    .iter()
                    .all(|(key, value)| variation.get(key).as_deref() == Some(value.as_str()))
            })
            .ok_or(VariationError::NoMatch)?;

        self.selected = Some(index);
        Ok(&self.variations[index])
    }

    /// Currently selected variation.
    pub fn selected(&self) -> Result<&Variation, VariationError> {
        self.selected
            .map(|index| &self.variations[index])
            .ok_or(VariationError::NoneSelected)
    }

    /// Folds the set over field names: one OptionSpec per field with
    /// the union of observed choices. This is what the CLI enumerates.
    pub fn to_options(&self) -> Vec<OptionSpec> {
        let mut options: BTreeMap<String, OptionSpec> = BTreeMap::new();
        for variation in &self.variations {
            for (field, value) in variation.to_map() {
                options
                    .entry(field.clone())
                    .or_insert_with(|| OptionSpec::new(field))
                    .add(value);
            }
        }
        options.into_values().collect()
    }
}

// ============================================================================
// 4. OPTION SPEC
// ============================================================================

/// One CLI option derived from a Variations set: a name and the sorted
/// union of choices observed across all variations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionSpec {
    name: String,
    choices: BTreeSet<String>,
}

impl OptionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            choices: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&mut self, choice: impl Into<String>) {
        self.choices.insert(choice.into());
    }

    pub fn contains(&self, choice: &str) -> bool {
        self.choices.contains(choice)
    }

    /// All choices, sorted.
    pub fn choices(&self) -> impl Iterator<Item = &str> {
        self.choices.iter().map(String::as_str)
    }
}

// =============================================================================
// TESTS
// =============================================================================
