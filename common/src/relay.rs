use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayState {
    #[default]
    Off,
    Pulsing,
    Held,
}

impl RelayState {
    pub fn outputs(self) -> RelayOutputs {
        match self {
            Self::Off => RelayOutputs {
                trigger: false,
                hold: false,
            },
            Self::Pulsing => RelayOutputs {
                trigger: true,
                hold: false,
            },
            Self::Held => RelayOutputs {
                trigger: false,
                hold: true,
            },
        }
    }
}

/// Levels for the two relay GPIO lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayOutputs {
    pub trigger: bool,
    pub hold: bool,
}

/// Output side of the relay hardware.
pub trait RelayPins {
    fn set_trigger(&mut self, level: bool);

    fn set_hold(&mut self, level: bool);

    /// Drops before raises so both lines are never high at once.
    fn apply(&mut self, outputs: RelayOutputs) {
        if !outputs.trigger {
            self.set_trigger(false);
        }
        if !outputs.hold {
            self.set_hold(false);
        }
        if outputs.trigger {
            self.set_trigger(true);
        }
        if outputs.hold {
            self.set_hold(true);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelayActuator {
    state: RelayState,
}

impl RelayActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn outputs(&self) -> RelayOutputs {
        self.state.outputs()
    }

    /// Advance one actuation tick toward `desired`.
    pub fn tick(&mut self, desired: bool) -> RelayOutputs {
        self.state = match (desired, self.state) {
            (false, _) => RelayState::Off,
            (true, RelayState::Off) => RelayState::Pulsing,
            (true, RelayState::Pulsing | RelayState::Held) => RelayState::Held,
        };
        self.state.outputs()
    }
}
