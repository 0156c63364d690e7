//! Road scenarios for deterministic simulation.

use crate::error::SimError;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// SIM-001: follower closes on a slower leader in the same lane
    Tailgate,

    /// SIM-002: opposite-direction pass at arm's length
    Oncoming,

    /// SIM-003: ego sheds more than 40 km/h between two samples
    HardBrake,

    /// SIM-004: peer goes silent without deleting its record
    Dropout,

    /// SIM-005: peer deletes its record from the store
    Retract,

    /// SIM-006: tailgate over a store losing half its notifications
    Lossy,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Tailgate,
            ScenarioId::Oncoming,
            ScenarioId::HardBrake,
            ScenarioId::Dropout,
            ScenarioId::Retract,
            ScenarioId::Lossy,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Tailgate => "tailgate",
            ScenarioId::Oncoming => "oncoming",
            ScenarioId::HardBrake => "hard_brake",
            ScenarioId::Dropout => "dropout",
            ScenarioId::Retract => "retract",
            ScenarioId::Lossy => "lossy",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Tailgate => "70 km/h follower closes on a 50 km/h leader, expect DANGER",
            ScenarioId::Oncoming => "Opposite-direction pass 3 m apart, expect SAFE throughout",
            ScenarioId::HardBrake => "80 km/h to standstill at 9 m/s², expect one emergency event",
            ScenarioId::Dropout => "Peer stops publishing, expect eviction within timeout + tick",
            ScenarioId::Retract => "Peer deletes its record, expect immediate removal",
            ScenarioId::Lossy => "Tailgate with 50% notification loss, expect DANGER anyway",
        }
    }

    /// Shortest run that lets the scenario's assertions play out.
    pub fn min_duration_secs(&self) -> f64 {
        match self {
            ScenarioId::Tailgate | ScenarioId::Lossy => 20.0,
            ScenarioId::Oncoming => 12.0,
            ScenarioId::HardBrake => 10.0,
            ScenarioId::Dropout => 25.0,
            ScenarioId::Retract => 10.0,
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tailgate" | "sim-001" => Ok(ScenarioId::Tailgate),
            "oncoming" | "sim-002" => Ok(ScenarioId::Oncoming),
            "hard_brake" | "hardbrake" | "sim-003" => Ok(ScenarioId::HardBrake),
            "dropout" | "sim-004" => Ok(ScenarioId::Dropout),
            "retract" | "sim-005" => Ok(ScenarioId::Retract),
            "lossy" | "sim-006" => Ok(ScenarioId::Lossy),
            _ => Err(SimError::UnknownScenario(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>().unwrap(), scenario);
        }
        assert_eq!("SIM-003".parse::<ScenarioId>().unwrap(), ScenarioId::HardBrake);
    }

    #[test]
    fn test_unknown_scenario() {
        assert!(matches!("split_brain".parse::<ScenarioId>(), Err(SimError::UnknownScenario(_))));
    }
}
