use crate::error::HarnessError;
use serde::Deserialize;
use std::fmt;
use tracing::debug;

/// A single prerequisite that must hold before a test payload runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum Requirement {
    /// The minimal client finished its handshake
    Connection,
    /// A player controller was replicated to the minimal client
    PlayerController,
    /// A pawn was replicated to the minimal client
    Pawn,
    /// A Ping/Pong round-trip completed
    Ping,
    /// A beacon connection was accepted
    Beacon,
    /// The remote test agent object is present
    NutActor,
    /// A test-specific condition reported by the payload
    Custom,
}

const REQUIREMENT_COUNT: usize = 7;

impl Requirement {
    pub const ALL: [Requirement; REQUIREMENT_COUNT] = [
        Requirement::Connection,
        Requirement::PlayerController,
        Requirement::Pawn,
        Requirement::Ping,
        Requirement::Beacon,
        Requirement::NutActor,
        Requirement::Custom,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Requirement::Connection => "Connection",
            Requirement::PlayerController => "PlayerController",
            Requirement::Pawn => "Pawn",
            Requirement::Ping => "Ping",
            Requirement::Beacon => "Beacon",
            Requirement::NutActor => "NutActor",
            Requirement::Custom => "Custom",
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed-size set of requirements, one slot per `Requirement` variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "Vec<Requirement>")]
pub struct RequirementSet {
    slots: [bool; REQUIREMENT_COUNT],
}

impl RequirementSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, requirement: Requirement) {
        self.slots[requirement.index()] = true;
    }

    pub fn remove(&mut self, requirement: Requirement) {
        self.slots[requirement.index()] = false;
    }

    pub fn contains(&self, requirement: Requirement) -> bool {
        self.slots[requirement.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = Requirement> + '_ {
        Requirement::ALL.into_iter().filter(|r| self.contains(*r))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| **s).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when every member of `self` is also in `other`.
    pub fn is_subset(&self, other: &RequirementSet) -> bool {
        self.iter().all(|r| other.contains(r))
    }

    /// Members of `self` missing from `other`.
    pub fn difference(&self, other: &RequirementSet) -> RequirementSet {
        self.iter().filter(|r| !other.contains(*r)).collect()
    }

    /// Renders the set as one character per requirement, in declaration order.
    pub fn to_bit_string(&self) -> String {
        self.slots.iter().map(|s| if *s { '1' } else { '0' }).collect()
    }
}

impl FromIterator<Requirement> for RequirementSet {
    fn from_iter<I: IntoIterator<Item = Requirement>>(iter: I) -> Self {
        let mut set = RequirementSet::new();
        for requirement in iter {
            set.insert(requirement);
        }
        set
    }
}

impl From<Vec<Requirement>> for RequirementSet {
    fn from(list: Vec<Requirement>) -> Self {
        list.into_iter().collect()
    }
}

impl fmt::Display for RequirementSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Requirement::name).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}

/// Checks the declared requirements for combinations the harness cannot serve.
///
/// A ping test exists to validate the harness itself: besides the connection
/// it may only depend on the player controller that carries the ping.
pub fn validate_requirements(required: &RequirementSet) -> Result<(), HarnessError> {
    if required.contains(Requirement::Ping) {
        let extra: Vec<&str> = required
            .iter()
            .filter(|r| {
                !matches!(
                    r,
                    Requirement::Ping | Requirement::Connection | Requirement::PlayerController
                )
            })
            .map(Requirement::name)
            .collect();

        if !extra.is_empty() {
            return Err(HarnessError::ValidationFailed(format!(
                "Ping must be the sole requirement, but {} also required",
                extra.join(", ")
            )));
        }
    }

    Ok(())
}

type SatisfiedCallback = Box<dyn FnOnce() + Send>;

/// Tracks required and met prerequisites and fires the payload exactly once.
pub struct RequirementsStateMachine {
    required: RequirementSet,
    met: RequirementSet,
    fired: bool,
    callback: Option<SatisfiedCallback>,
}

impl Default for RequirementsStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RequirementsStateMachine {
    pub fn new() -> Self {
        Self {
            required: RequirementSet::new(),
            met: RequirementSet::new(),
            fired: false,
            callback: None,
        }
    }

    /// Starts a new declaration scope; met flags and the fired latch are cleared.
    pub fn declare(&mut self, required: RequirementSet) -> Result<(), HarnessError> {
        validate_requirements(&required)?;

        self.required = required;
        self.met = RequirementSet::new();
        self.fired = false;
        self.callback = None;
        Ok(())
    }

    /// Records a met requirement. Returns true when this call fired the payload.
    pub fn mark_met(&mut self, requirement: Requirement) -> bool {
        if !self.met.contains(requirement) {
            debug!(requirement = %requirement, "requirement met");
            self.met.insert(requirement);
        }

        self.try_fire()
    }

    /// Clears met flags after a reconnect. The fired latch is kept.
    pub fn reset(&mut self) {
        self.met = RequirementSet::new();
    }

    pub fn is_satisfied(&self) -> bool {
        self.required.is_subset(&self.met)
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// Registers a callback run once the requirements are satisfied.
    ///
    /// Runs immediately when already satisfied and not yet fired.
    pub fn fire_once_when_satisfied(&mut self, callback: impl FnOnce() + Send + 'static) {
        if self.fired {
            return;
        }

        self.callback = Some(Box::new(callback));
        self.try_fire();
    }

    /// Latches the fired state if satisfied. Returns true on the transition.
    pub fn try_fire(&mut self) -> bool {
        if self.fired || !self.is_satisfied() {
            return false;
        }

        self.fired = true;
        if let Some(callback) = self.callback.take() {
            callback();
        }
        true
    }

    pub fn required(&self) -> RequirementSet {
        self.required
    }

    pub fn met(&self) -> RequirementSet {
        self.met
    }

    /// Required requirements not (yet) observed.
    pub fn unmet(&self) -> RequirementSet {
        self.required.difference(&self.met)
    }
}
