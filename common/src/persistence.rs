use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::StoreError,
    schedule::{DayMask, ScheduleTable, MAX_SCHEDULE_MINUTE, SLOT_COUNT},
};

pub const HEATING_ENABLED_KEY: &str = "heating_state";

const FIELD_DAYS: usize = 0;
const FIELD_ON: usize = 1;
const FIELD_OFF: usize = 2;
const FIELDS_PER_SLOT: usize = 3;

/// `timer_<slot>_<field>` with slot 0-5 and field 0 = days, 1 = on, 2 = off.
pub fn timer_key(slot: usize, field: usize) -> String {
    format!("timer_{slot}_{field}")
}

/// Flat key-value map. Nothing is durable before `commit`.
pub trait KeyValueStore {
    fn get_u16(&self, key: &str) -> Result<Option<u16>, StoreError>;

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError>;

    fn set_u16(&mut self, key: &str, value: u16) -> Result<(), StoreError>;

    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError>;

    fn remove(&mut self, key: &str) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    fn discard(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    U16(u16),
    Bool(bool),
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    committed: BTreeMap<String, StoredValue>,
    staged: BTreeMap<String, Option<StoredValue>>,
    commits: usize,
    fail_commits: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: BTreeMap<String, StoredValue>) -> Self {
        Self {
            committed: entries,
            ..Self::default()
        }
    }

    pub fn entries(&self) -> &BTreeMap<String, StoredValue> {
        &self.committed
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    pub fn set_fail_commits(&mut self, fail: bool) {
        self.fail_commits = fail;
    }

    pub fn staged_view(&self) -> BTreeMap<String, StoredValue> {
        let mut view = self.committed.clone();
        for (key, value) in &self.staged {
            match value {
                Some(value) => view.insert(key.clone(), *value),
                None => view.remove(key),
            };
        }
        view
    }

    fn get(&self, key: &str) -> Option<StoredValue> {
        self.committed.get(key).copied()
    }

    fn type_mismatch(key: &str, expected: &str) -> StoreError {
        StoreError::Read {
            key: key.to_string(),
            reason: format!("stored value is not a {expected}"),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn get_u16(&self, key: &str) -> Result<Option<u16>, StoreError> {
        match self.get(key) {
            None => Ok(None),
            Some(StoredValue::U16(value)) => Ok(Some(value)),
            Some(_) => Err(Self::type_mismatch(key, "u16")),
        }
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
        match self.get(key) {
            None => Ok(None),
            Some(StoredValue::Bool(value)) => Ok(Some(value)),
            Some(_) => Err(Self::type_mismatch(key, "bool")),
        }
    }

    fn set_u16(&mut self, key: &str, value: u16) -> Result<(), StoreError> {
        self.staged
            .insert(key.to_string(), Some(StoredValue::U16(value)));
        Ok(())
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.staged
            .insert(key.to_string(), Some(StoredValue::Bool(value)));
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.staged.insert(key.to_string(), None);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if self.fail_commits {
            return Err(StoreError::Commit("commit rejected".to_string()));
        }

        self.committed = self.staged_view();
        self.staged.clear();
        self.commits += 1;
        Ok(())
    }

    fn discard(&mut self) {
        self.staged.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedState {
    /// `None` on first boot.
    pub table: Option<ScheduleTable>,
    pub heating_enabled: Option<bool>,
    pub gaps: Vec<String>,
}

#[derive(Debug)]
pub struct PersistenceGateway<S> {
    store: S,
}

impl<S: KeyValueStore> PersistenceGateway<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn save(&mut self, table: &ScheduleTable, heating_enabled: bool) -> Result<(), StoreError> {
        let result = self.write_all(table, heating_enabled);
        if result.is_err() {
            self.store.discard();
        }
        result
    }

    /// Absent, unreadable or out-of-range keys keep their default and are
    /// reported as gaps.
    pub fn load(&self) -> LoadedState {
        let mut table = ScheduleTable::default();
        let mut gaps = Vec::new();
        let mut any_present = false;

        for slot_index in 0..SLOT_COUNT {
            for field in 0..FIELDS_PER_SLOT {
                let key = timer_key(slot_index, field);
                let value = match self.store.get_u16(&key) {
                    Ok(Some(value)) => value,
                    Ok(None) => {
                        gaps.push(key);
                        continue;
                    }
                    Err(_) => {
                        any_present = true;
                        gaps.push(key);
                        continue;
                    }
                };
                any_present = true;

                let Some(slot) = table.slot_mut(slot_index) else {
                    continue;
                };
                let applied = match field {
                    FIELD_DAYS if value <= u16::from(DayMask::EVERY_DAY.bits()) => {
                        slot.days = DayMask::from_bits_truncate(value);
                        true
                    }
                    FIELD_ON if value <= MAX_SCHEDULE_MINUTE => {
                        slot.on_minute = value;
                        true
                    }
                    FIELD_OFF if value <= MAX_SCHEDULE_MINUTE => {
                        slot.off_minute = value;
                        true
                    }
                    _ => false,
                };
                if !applied {
                    gaps.push(key);
                }
            }
        }

        let (heating_enabled, flag_readable) = match self.store.get_bool(HEATING_ENABLED_KEY) {
            Ok(value) => (value, true),
            Err(_) => (None, false),
        };
        if !any_present {
            let gaps = if flag_readable {
                Vec::new()
            } else {
                vec![HEATING_ENABLED_KEY.to_string()]
            };
            return LoadedState {
                table: None,
                heating_enabled,
                gaps,
            };
        }

        if heating_enabled.is_none() {
            gaps.push(HEATING_ENABLED_KEY.to_string());
        }
        LoadedState {
            table: Some(table),
            heating_enabled,
            gaps,
        }
    }

    fn write_all(&mut self, table: &ScheduleTable, heating_enabled: bool) -> Result<(), StoreError> {
        for (index, slot) in table.slots().iter().enumerate() {
            self.store
                .set_u16(&timer_key(index, FIELD_DAYS), u16::from(slot.days.bits()))?;
            self.store
                .set_u16(&timer_key(index, FIELD_ON), slot.on_minute)?;
            self.store
                .set_u16(&timer_key(index, FIELD_OFF), slot.off_minute)?;
        }
        self.store.set_bool(HEATING_ENABLED_KEY, heating_enabled)?;
        self.store.commit()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::schedule::ScheduleSlot;

    fn sample_table() -> ScheduleTable {
        ScheduleTable::from_slots([
            ScheduleSlot::new(0x1F, 360, 420).unwrap(),
            ScheduleSlot::new(0x60, 480, 600).unwrap(),
            ScheduleSlot::new(0x7F, 1380, 60).unwrap(),
            ScheduleSlot::new(0x01, 0, 1410).unwrap(),
            ScheduleSlot::new(0x00, 700, 700).unwrap(),
            ScheduleSlot::new(0x40, 1000, 1010).unwrap(),
        ])
    }

    #[test]
    fn save_then_load_round_trips() {
        let mut gateway = PersistenceGateway::new(MemoryStore::new());
        gateway.save(&sample_table(), false).unwrap();

        let loaded = gateway.load();
        assert_eq!(loaded.table, Some(sample_table()));
        assert_eq!(loaded.heating_enabled, Some(false));
        assert!(loaded.gaps.is_empty());
        assert_eq!(gateway.store().entries().len(), 19);
        assert_eq!(gateway.store().commits(), 1);
    }

    #[test]
    fn empty_store_is_first_boot() {
        let gateway = PersistenceGateway::new(MemoryStore::new());
        assert_eq!(gateway.load(), LoadedState::default());
    }

    #[test]
    fn heating_flag_is_read_without_a_table() {
        let mut store = MemoryStore::new();
        store.set_bool(HEATING_ENABLED_KEY, false).unwrap();
        store.commit().unwrap();

        let loaded = PersistenceGateway::new(store).load();
        assert_eq!(loaded.table, None);
        assert_eq!(loaded.heating_enabled, Some(false));
        assert!(loaded.gaps.is_empty());
    }

    #[test]
    fn missing_key_falls_back_to_that_field_default() {
        let mut gateway = PersistenceGateway::new(MemoryStore::new());
        gateway.save(&sample_table(), true).unwrap();

        let store = gateway.store_mut();
        store.remove(&timer_key(2, 1)).unwrap();
        store.commit().unwrap();

        let loaded = gateway.load();
        let mut expected = sample_table();
        expected.slot_mut(2).unwrap().on_minute = ScheduleTable::default().slots()[2].on_minute;

        assert_eq!(loaded.table, Some(expected));
        assert_eq!(loaded.heating_enabled, Some(true));
        assert_eq!(loaded.gaps, vec!["timer_2_1".to_string()]);
    }

    #[test]
    fn out_of_range_stored_value_is_a_gap() {
        let mut store = MemoryStore::new();
        store.set_u16(&timer_key(0, 0), 0x1FF).unwrap();
        store.set_u16(&timer_key(0, 2), 1439).unwrap();
        store.set_u16(&timer_key(1, 1), 100).unwrap();
        store.commit().unwrap();

        let loaded = PersistenceGateway::new(store).load();
        let table = loaded.table.unwrap();
        let defaults = ScheduleTable::default();

        assert_eq!(table.slots()[0], defaults.slots()[0]);
        assert_eq!(table.slots()[1].on_minute, 100);
        assert!(loaded.gaps.contains(&"timer_0_0".to_string()));
        assert!(loaded.gaps.contains(&"timer_0_2".to_string()));
        assert!(loaded.gaps.contains(&HEATING_ENABLED_KEY.to_string()));
        assert_eq!(loaded.heating_enabled, None);
    }

    #[test]
    fn mistyped_key_keeps_the_rest_of_the_table() {
        let mut gateway = PersistenceGateway::new(MemoryStore::new());
        gateway.save(&sample_table(), false).unwrap();

        let store = gateway.store_mut();
        store.set_u16(HEATING_ENABLED_KEY, 1).unwrap();
        store.set_bool(&timer_key(1, 2), true).unwrap();
        store.commit().unwrap();

        let loaded = gateway.load();
        let mut expected = sample_table();
        expected.slot_mut(1).unwrap().off_minute = ScheduleTable::default().slots()[1].off_minute;

        assert_eq!(loaded.table, Some(expected));
        assert_eq!(loaded.heating_enabled, None);
        assert_eq!(
            loaded.gaps,
            vec!["timer_1_2".to_string(), HEATING_ENABLED_KEY.to_string()]
        );
    }

    #[test]
    fn mistyped_flag_without_a_table_is_still_first_boot() {
        let mut store = MemoryStore::new();
        store.set_u16(HEATING_ENABLED_KEY, 1).unwrap();
        store.commit().unwrap();

        let loaded = PersistenceGateway::new(store).load();
        assert_eq!(loaded.table, None);
        assert_eq!(loaded.heating_enabled, None);
        assert_eq!(loaded.gaps, vec![HEATING_ENABLED_KEY.to_string()]);
    }

    #[test]
    fn failed_commit_leaves_previous_state() {
        let mut gateway = PersistenceGateway::new(MemoryStore::new());
        gateway.save(&ScheduleTable::default(), true).unwrap();

        gateway.store_mut().set_fail_commits(true);
        assert!(gateway.save(&sample_table(), false).is_err());
        gateway.store_mut().set_fail_commits(false);

        let loaded = gateway.load();
        assert_eq!(loaded.table, Some(ScheduleTable::default()));
        assert_eq!(loaded.heating_enabled, Some(true));

        gateway.store_mut().commit().unwrap();
        assert_eq!(gateway.load().table, Some(ScheduleTable::default()));
    }

    #[test]
    fn key_layout_is_fixed() {
        assert_eq!(timer_key(0, 0), "timer_0_0");
        assert_eq!(timer_key(5, 2), "timer_5_2");
    }
}
