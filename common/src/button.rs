const HIGH_MASK: u16 = 0xFE00;
const PRESS_PATTERN: u16 = 0xFF00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonPressed;

#[derive(Debug, Clone, Default)]
pub struct ButtonDebouncer {
    history: u16,
}

impl ButtonDebouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `level` is the raw pin reading; `false` means pressed.
    pub fn sample(&mut self, level: bool) -> Option<ButtonPressed> {
        self.history = (self.history << 1) | u16::from(level) | HIGH_MASK;
        (self.history == PRESS_PATTERN).then_some(ButtonPressed)
    }
}
