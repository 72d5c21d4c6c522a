/// Coalesced "state changed" flag, consumed once per broadcast tick.
#[derive(Debug, Clone, Default)]
pub struct ChangeNotifier {
    dirty: bool,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Read-and-clear.
    pub fn take(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}
