//! Profile-indexed step tables and the step factory
//!
//! Built once at start-up and read-only afterwards. Each profile has an
//! ordered [`StepTable`] for reporting and validation, and a map from
//! [`StepKind`] to the constructor of that profile's implementation.

use crate::cluster::Profile;
use crate::error::{Error, Result};
use crate::step::{BoxedStep, StepKind};
use serde::Serialize;
use std::collections::HashMap;

/// Constructor for a concrete step
pub type StepConstructor = fn() -> BoxedStep;

/// One row of a profile's step table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableEntry {
    /// 1-based sequence position
    pub position: u32,
    pub kind: StepKind,
    pub description: &'static str,
    /// Index of the external tool stage this step corresponds to
    pub tool_index: u32,
}

/// Ordered step table of one profile
#[derive(Debug, Clone, Serialize)]
pub struct StepTable {
    pub profile: Profile,
    entries: Vec<TableEntry>,
}

impl StepTable {
    fn new(profile: Profile) -> Self {
        Self {
            profile,
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[TableEntry] {
        &self.entries
    }

    pub fn get(&self, kind: StepKind) -> Option<&TableEntry> {
        self.entries.iter().find(|e| e.kind == kind)
    }

    pub fn contains(&self, kind: StepKind) -> bool {
        self.get(kind).is_some()
    }

    /// Forward step list in table order
    pub fn default_forward(&self) -> Vec<StepKind> {
        self.entries.iter().map(|e| e.kind).collect()
    }

    /// Undo step list, the table order reversed
    pub fn default_undo(&self) -> Vec<StepKind> {
        self.entries.iter().rev().map(|e| e.kind).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct ProfileSteps {
    table: StepTable,
    constructors: HashMap<StepKind, StepConstructor>,
}

/// Definition of one profile, handed to [`RegistryBuilder::profile`]
pub struct ProfileBuilder {
    steps: ProfileSteps,
    duplicates: Vec<StepKind>,
}

impl ProfileBuilder {
    /// Append a step to the table with its implementation
    pub fn step(
        mut self,
        kind: StepKind,
        description: &'static str,
        tool_index: u32,
        constructor: StepConstructor,
    ) -> Self {
        if self.steps.constructors.insert(kind, constructor).is_some() {
            self.duplicates.push(kind);
            return self;
        }
        let position = u32::try_from(self.steps.table.entries.len() + 1).unwrap_or(u32::MAX);
        self.steps.table.entries.push(TableEntry {
            position,
            kind,
            description,
            tool_index,
        });
        self
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    profiles: Vec<(ProfileSteps, Vec<StepKind>)>,
}

impl RegistryBuilder {
    /// Define the table and implementations of `profile`
    pub fn profile(
        mut self,
        profile: Profile,
        define: impl FnOnce(ProfileBuilder) -> ProfileBuilder,
    ) -> Self {
        let builder = define(ProfileBuilder {
            steps: ProfileSteps {
                table: StepTable::new(profile),
                constructors: HashMap::new(),
            },
            duplicates: Vec::new(),
        });
        self.profiles.push((builder.steps, builder.duplicates));
        self
    }

    /// Freeze the registry, rejecting duplicate profiles or steps
    pub fn build(self) -> Result<StepRegistry> {
        let mut profiles = HashMap::new();
        for (steps, duplicates) in self.profiles {
            let profile = steps.table.profile;
            if let Some(kind) = duplicates.first() {
                return Err(Error::invalid_setting(
                    format!("registry.{profile}"),
                    format!("step {kind} defined twice"),
                ));
            }
            if profiles.insert(profile, steps).is_some() {
                return Err(Error::invalid_setting(
                    format!("registry.{profile}"),
                    "profile defined twice",
                ));
            }
        }
        Ok(StepRegistry { profiles })
    }
}

/// Immutable profile → step implementation map
pub struct StepRegistry {
    profiles: HashMap<Profile, ProfileSteps>,
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut profiles: Vec<_> = self.profiles.keys().collect();
        profiles.sort();
        f.debug_struct("StepRegistry")
            .field("profiles", &profiles)
            .finish()
    }
}

impl StepRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    fn steps(&self, profile: Profile) -> Result<&ProfileSteps> {
        self.profiles
            .get(&profile)
            .ok_or_else(|| Error::UnknownProfile(profile.to_string()))
    }

    /// Registered profiles, in declaration order of [`Profile::ALL`]
    pub fn profiles(&self) -> Vec<Profile> {
        Profile::ALL
            .into_iter()
            .filter(|p| self.profiles.contains_key(p))
            .collect()
    }

    pub fn table(&self, profile: Profile) -> Result<&StepTable> {
        Ok(&self.steps(profile)?.table)
    }

    /// Constructor for `name` under `profile`.
    ///
    /// A name absent from the profile is a configuration error.
    pub fn resolve(&self, name: &str, profile: Profile) -> Result<(StepKind, StepConstructor)> {
        let steps = self.steps(profile)?;
        StepKind::from_name(name)
            .and_then(|kind| steps.constructors.get(&kind).map(|c| (kind, *c)))
            .ok_or_else(|| Error::UnknownStep {
                name: name.trim().to_string(),
                profile: profile.to_string(),
            })
    }

    /// Resolve a whole step list, failing on the first unknown name
    pub fn resolve_all<S: AsRef<str>>(
        &self,
        names: &[S],
        profile: Profile,
    ) -> Result<Vec<(StepKind, StepConstructor)>> {
        names
            .iter()
            .map(|name| self.resolve(name.as_ref(), profile))
            .collect()
    }
}
