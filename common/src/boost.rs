use crate::config::BoostConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoostTransition {
    Started,
    Extended,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct BoostController {
    config: BoostConfig,
    countdown_secs: u16,
    press_count: u8,
}

impl BoostController {
    pub fn new(config: BoostConfig) -> Self {
        Self {
            config,
            countdown_secs: 0,
            press_count: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.countdown_secs > 0
    }

    pub fn countdown_secs(&self) -> u16 {
        self.countdown_secs
    }

    pub fn press_count(&self) -> u8 {
        self.press_count
    }

    /// Web API: activate, extend, extend, cancel.
    pub fn increment(&mut self) -> BoostTransition {
        if !self.is_active() {
            return self.start();
        }

        if self.press_count < self.config.max_presses {
            self.countdown_secs = self
                .countdown_secs
                .saturating_add(self.config.increment_secs);
            self.press_count += 1;
            BoostTransition::Extended
        } else {
            self.cancel();
            BoostTransition::Cancelled
        }
    }

    /// Button: start or cancel.
    pub fn toggle(&mut self) -> BoostTransition {
        if self.is_active() {
            self.cancel();
            BoostTransition::Cancelled
        } else {
            self.start()
        }
    }

    /// Called once per second. Returns true when the countdown moved.
    pub fn tick_one_second(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }

        self.countdown_secs -= 1;
        if self.countdown_secs == 0 {
            self.press_count = 0;
        }
        true
    }

    pub fn cancel(&mut self) {
        self.countdown_secs = 0;
        self.press_count = 0;
    }

    fn start(&mut self) -> BoostTransition {
        self.countdown_secs = self.config.base_secs.max(1);
        self.press_count = 1;
        BoostTransition::Started
    }
}
