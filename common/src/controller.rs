use crate::{
    boost::{BoostController, BoostTransition},
    button::ButtonDebouncer,
    clock::CurrentTime,
    config::BoostConfig,
    error::CommandError,
    notifier::ChangeNotifier,
    persistence::{KeyValueStore, PersistenceGateway},
    relay::{RelayActuator, RelayOutputs, RelayState},
    schedule::{self, ScheduleSlot, ScheduleTable},
    types::{ApiReply, ApiRequest, StatusPayload},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoostSource {
    Button,
    Api,
}

/// Drained by the shell after each tick or command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    BoostStarted {
        source: BoostSource,
        countdown_secs: u16,
    },
    BoostExtended {
        countdown_secs: u16,
    },
    BoostCancelled {
        source: BoostSource,
    },
    BoostExpired,
    HeatingEnabledChanged(bool),
    IsHeatingChanged(bool),
    TimerUpdated {
        timer_number: u8,
        slot: ScheduleSlot,
    },
    PersistFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootSource {
    Persisted,
    /// Nothing stored yet.
    Defaults,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootReport {
    pub source: BootSource,
    pub gaps: Vec<String>,
}

#[derive(Debug)]
pub struct HeatingController<S> {
    table: ScheduleTable,
    heating_enabled: bool,
    is_heating: bool,
    now: CurrentTime,
    boost: BoostController,
    debouncer: ButtonDebouncer,
    relay: RelayActuator,
    notifier: ChangeNotifier,
    persistence: PersistenceGateway<S>,
    events: Vec<ControllerEvent>,
}

impl<S: KeyValueStore> HeatingController<S> {
    pub fn new(boost: BoostConfig, store: S, now: CurrentTime) -> (Self, BootReport) {
        let persistence = PersistenceGateway::new(store);

        let loaded = persistence.load();
        let report = BootReport {
            source: match loaded.table {
                Some(_) => BootSource::Persisted,
                None => BootSource::Defaults,
            },
            gaps: loaded.gaps,
        };
        let table = loaded.table.unwrap_or_default();
        let heating_enabled = loaded.heating_enabled.unwrap_or(true);

        let mut controller = Self {
            table,
            heating_enabled,
            is_heating: false,
            now,
            boost: BoostController::new(boost),
            debouncer: ButtonDebouncer::new(),
            relay: RelayActuator::new(),
            notifier: ChangeNotifier::new(),
            persistence,
            events: Vec::new(),
        };
        controller.is_heating = controller.evaluate();
        controller.notifier.mark();

        (controller, report)
    }

    pub fn table(&self) -> &ScheduleTable {
        &self.table
    }

    pub fn heating_enabled(&self) -> bool {
        self.heating_enabled
    }

    pub fn is_heating(&self) -> bool {
        self.is_heating
    }

    pub fn boost(&self) -> &BoostController {
        &self.boost
    }

    pub fn relay_state(&self) -> RelayState {
        self.relay.state()
    }

    pub fn now(&self) -> CurrentTime {
        self.now
    }

    pub fn store(&self) -> &S {
        self.persistence.store()
    }

    pub fn store_mut(&mut self) -> &mut S {
        self.persistence.store_mut()
    }

    pub fn drain_events(&mut self) -> std::vec::Drain<'_, ControllerEvent> {
        self.events.drain(..)
    }

    pub fn button_tick(&mut self, level: bool) {
        if self.debouncer.sample(level).is_some() {
            self.boost_toggle();
        }
    }

    pub fn boost_toggle(&mut self) {
        match self.boost.toggle() {
            BoostTransition::Started => self.boost_started(BoostSource::Button),
            _ => self.events.push(ControllerEvent::BoostCancelled {
                source: BoostSource::Button,
            }),
        }
        self.notifier.mark();
        self.refresh_heating();
    }

    pub fn relay_tick(&mut self) -> RelayOutputs {
        self.relay.tick(self.is_heating)
    }

    pub fn schedule_tick(&mut self, now: CurrentTime) {
        if self.boost.tick_one_second() {
            self.notifier.mark();
            if !self.boost.is_active() {
                self.events.push(ControllerEvent::BoostExpired);
            }
        }

        if now != self.now {
            self.now = now;
            self.notifier.mark();
        }

        self.refresh_heating();
    }

    pub fn attach_subscriber(&mut self) {
        self.notifier.mark();
    }

    pub fn take_broadcast(&mut self) -> Option<StatusPayload> {
        self.notifier.take().then(|| self.status())
    }

    pub fn status(&self) -> StatusPayload {
        StatusPayload::ok(
            self.now.day.number(),
            self.now.minute,
            self.heating_enabled,
            self.is_heating,
            self.boost.countdown_secs(),
            self.table.triples(),
        )
    }

    pub fn execute(&mut self, request: ApiRequest) -> Result<ApiReply, CommandError> {
        match request {
            ApiRequest::GetStatus => Ok(ApiReply::Status(self.status())),
            ApiRequest::TriggerHeating => self.trigger_heating(),
            ApiRequest::Boost => Ok(self.boost_increment()),
            ApiRequest::SetTimer(params) => {
                let (timer_number, slot) = params.validate()?;
                self.set_timer(timer_number, slot)
            }
        }
    }

    /// Toggle holiday mode.
    pub fn trigger_heating(&mut self) -> Result<ApiReply, CommandError> {
        let enabled = !self.heating_enabled;
        self.persistence.save(&self.table, enabled)?;

        self.heating_enabled = enabled;
        self.events
            .push(ControllerEvent::HeatingEnabledChanged(enabled));
        self.notifier.mark();
        self.refresh_heating();
        Ok(ApiReply::heating_state(enabled))
    }

    pub fn boost_increment(&mut self) -> ApiReply {
        match self.boost.increment() {
            BoostTransition::Started => self.boost_started(BoostSource::Api),
            BoostTransition::Extended => self.events.push(ControllerEvent::BoostExtended {
                countdown_secs: self.boost.countdown_secs(),
            }),
            BoostTransition::Cancelled => self.events.push(ControllerEvent::BoostCancelled {
                source: BoostSource::Api,
            }),
        }
        self.notifier.mark();
        self.refresh_heating();
        ApiReply::boost(self.boost.countdown_secs())
    }

    pub fn set_timer(&mut self, timer_number: u8, slot: ScheduleSlot) -> Result<ApiReply, CommandError> {
        let mut table = self.table.clone();
        table.set_timer(timer_number, slot)?;
        self.persistence.save(&table, self.heating_enabled)?;

        self.table = table;
        self.events.push(ControllerEvent::TimerUpdated { timer_number, slot });
        self.notifier.mark();
        self.refresh_heating();
        Ok(ApiReply::set_timer(timer_number, &slot))
    }

    fn boost_started(&mut self, source: BoostSource) {
        self.events.push(ControllerEvent::BoostStarted {
            source,
            countdown_secs: self.boost.countdown_secs(),
        });

        if self.heating_enabled {
            return;
        }

        // Boost always re-enables heating; a failed write does not undo that.
        self.heating_enabled = true;
        self.events
            .push(ControllerEvent::HeatingEnabledChanged(true));
        if let Err(err) = self.persistence.save(&self.table, true) {
            self.events
                .push(ControllerEvent::PersistFailed(err.to_string()));
        }
    }

    fn evaluate(&self) -> bool {
        schedule::evaluate(
            &self.table,
            self.heating_enabled,
            self.boost.is_active(),
            self.now.day,
            self.now.minute,
        )
    }

    fn refresh_heating(&mut self) {
        let is_heating = self.evaluate();
        if is_heating != self.is_heating {
            self.is_heating = is_heating;
            self.events.push(ControllerEvent::IsHeatingChanged(is_heating));
            self.notifier.mark();
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        error::ValidationError,
        persistence::{MemoryStore, HEATING_ENABLED_KEY},
        schedule::{DayOfWeek, SLOT_COUNT},
        types::SetTimerRequest,
    };

    const NOON_MONDAY: CurrentTime = CurrentTime {
        day: DayOfWeek::Mon,
        minute: 720,
    };

    fn controller() -> HeatingController<MemoryStore> {
        let (mut controller, report) =
            HeatingController::new(BoostConfig::default(), MemoryStore::new(), NOON_MONDAY);
        assert_eq!(report.source, BootSource::Defaults);
        controller.take_broadcast();
        controller.drain_events();
        controller
    }

    fn set_timer_request(number: i64, days: i64, on: i64, off: i64) -> ApiRequest {
        ApiRequest::SetTimer(SetTimerRequest {
            timer_number: Some(number),
            new_days: Some(days),
            new_on_time: Some(on),
            new_off_time: Some(off),
        })
    }

    fn press_button(controller: &mut HeatingController<MemoryStore>) {
        for _ in 0..16 {
            controller.button_tick(true);
        }
        for _ in 0..20 {
            controller.button_tick(false);
        }
        for _ in 0..16 {
            controller.button_tick(true);
        }
    }

    #[test]
    fn boots_from_persisted_state() {
        let mut table = ScheduleTable::default();
        table
            .set_timer(3, ScheduleSlot::new(0x01, 700, 800).unwrap())
            .unwrap();
        let mut gateway = PersistenceGateway::new(MemoryStore::new());
        gateway.save(&table, false).unwrap();
        let store = gateway.into_store();

        let (controller, report) =
            HeatingController::new(BoostConfig::default(), store, NOON_MONDAY);

        assert_eq!(report.source, BootSource::Persisted);
        assert!(report.gaps.is_empty());
        assert_eq!(controller.table(), &table);
        assert!(!controller.heating_enabled());
    }

    #[test]
    fn mistyped_heating_flag_keeps_the_persisted_table() {
        let mut table = ScheduleTable::default();
        table
            .set_timer(2, ScheduleSlot::new(0x1F, 700, 800).unwrap())
            .unwrap();
        let mut gateway = PersistenceGateway::new(MemoryStore::new());
        gateway.save(&table, false).unwrap();
        let mut store = gateway.into_store();
        store.set_u16(HEATING_ENABLED_KEY, 1).unwrap();
        store.commit().unwrap();

        let (controller, report) =
            HeatingController::new(BoostConfig::default(), store, NOON_MONDAY);

        assert_eq!(report.source, BootSource::Persisted);
        assert_eq!(report.gaps, vec![HEATING_ENABLED_KEY.to_string()]);
        assert_eq!(controller.table(), &table);
        assert!(controller.heating_enabled());
    }

    #[test]
    fn stored_holiday_flag_survives_without_a_table() {
        let mut store = MemoryStore::new();
        store.set_bool(HEATING_ENABLED_KEY, false).unwrap();
        store.commit().unwrap();

        let (controller, report) =
            HeatingController::new(BoostConfig::default(), store, NOON_MONDAY);

        assert_eq!(report.source, BootSource::Defaults);
        assert_eq!(controller.table(), &ScheduleTable::default());
        assert!(!controller.heating_enabled());
    }

    #[test]
    fn first_boot_uses_defaults_and_broadcasts() {
        let (mut controller, report) =
            HeatingController::new(BoostConfig::default(), MemoryStore::new(), NOON_MONDAY);

        assert_eq!(report.source, BootSource::Defaults);
        assert!(controller.heating_enabled());
        assert_eq!(controller.table(), &ScheduleTable::default());
        assert_eq!(controller.store().commits(), 0);
        assert!(controller.take_broadcast().is_some());
    }

    #[test]
    fn set_timer_persists_and_marks_dirty() {
        let mut controller = controller();

        let reply = controller.execute(set_timer_request(2, 0x1F, 700, 760)).unwrap();
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            serde_json::json!({
                "status": "OK",
                "timer_number": 2,
                "new_days": 31,
                "new_on_time": 700,
                "new_off_time": 760,
            })
        );

        assert_eq!(controller.table().slots()[1], ScheduleSlot::new(0x1F, 700, 760).unwrap());
        assert_eq!(controller.store().commits(), 1);
        assert!(controller.is_heating());

        let broadcast = controller.take_broadcast().unwrap();
        assert_eq!(broadcast.timers[1], [31, 700, 760]);
        assert!(controller.take_broadcast().is_none());
    }

    #[test]
    fn rejected_set_timer_changes_nothing() {
        let mut controller = controller();
        let before = controller.table().clone();

        let err = controller
            .execute(set_timer_request(1, 0x7F, 1411, 60))
            .unwrap_err();

        assert!(matches!(err, CommandError::Validation(ValidationError::OnTime)));
        assert_eq!(err.http_status(), 400);
        assert_eq!(err.to_string(), "new_on_time must be between 0 and 1410");
        assert_eq!(controller.table(), &before);
        assert_eq!(controller.store().commits(), 0);
        assert!(controller.store().entries().is_empty());
        assert!(controller.take_broadcast().is_none());
    }

    #[test]
    fn failed_persist_leaves_memory_untouched() {
        let mut controller = controller();
        controller.store_mut().set_fail_commits(true);

        let err = controller
            .execute(set_timer_request(4, 0x7F, 0, 1410))
            .unwrap_err();
        assert_eq!(err.http_status(), 500);
        assert_eq!(controller.table(), &ScheduleTable::default());

        assert!(controller.execute(ApiRequest::TriggerHeating).is_err());
        assert!(controller.heating_enabled());
        assert!(controller.take_broadcast().is_none());
    }

    #[test]
    fn trigger_heating_toggles_and_persists() {
        let mut controller = controller();
        controller.schedule_tick(CurrentTime::new(DayOfWeek::Mon, 400));
        assert!(controller.is_heating());

        let reply = controller.execute(ApiRequest::TriggerHeating).unwrap();
        assert_eq!(reply, ApiReply::heating_state(false));
        assert!(!controller.is_heating());
        assert_eq!(
            controller.store().entries().get(HEATING_ENABLED_KEY),
            Some(&crate::persistence::StoredValue::Bool(false))
        );

        controller.execute(ApiRequest::TriggerHeating).unwrap();
        assert!(controller.heating_enabled());
        assert!(controller.is_heating());
        assert_eq!(controller.store().commits(), 2);
    }

    #[test]
    fn api_boost_ladder_and_heating_override() {
        let mut controller = controller();
        controller.execute(ApiRequest::TriggerHeating).unwrap();
        assert!(!controller.heating_enabled());
        assert!(!controller.is_heating());

        let countdowns: Vec<ApiReply> = (0..4)
            .map(|_| controller.execute(ApiRequest::Boost).unwrap())
            .collect();
        assert_eq!(
            countdowns,
            vec![
                ApiReply::boost(1800),
                ApiReply::boost(2700),
                ApiReply::boost(3600),
                ApiReply::boost(0),
            ]
        );

        // Boost re-enabled heating, and that stuck after the cancel.
        assert!(controller.heating_enabled());
        assert!(!controller.is_heating());
        assert_eq!(
            controller.store().entries().get(HEATING_ENABLED_KEY),
            Some(&crate::persistence::StoredValue::Bool(true))
        );
    }

    #[test]
    fn button_press_toggles_boost() {
        let mut controller = controller();
        assert!(!controller.is_heating());

        press_button(&mut controller);
        assert_eq!(controller.boost().countdown_secs(), 1800);
        assert!(controller.is_heating());
        let events: Vec<ControllerEvent> = controller.drain_events().collect();
        assert!(events.contains(&ControllerEvent::BoostStarted {
            source: BoostSource::Button,
            countdown_secs: 1800,
        }));

        press_button(&mut controller);
        assert_eq!(controller.boost().countdown_secs(), 0);
        assert!(!controller.is_heating());
    }

    #[test]
    fn boost_decays_each_schedule_tick_and_expires() {
        let mut controller = HeatingController::new(
            BoostConfig {
                base_secs: 2,
                ..BoostConfig::default()
            },
            MemoryStore::new(),
            NOON_MONDAY,
        )
        .0;
        controller.execute(ApiRequest::Boost).unwrap();
        controller.take_broadcast();
        controller.drain_events();

        controller.schedule_tick(NOON_MONDAY);
        assert!(controller.take_broadcast().is_some());
        assert!(controller.is_heating());

        controller.schedule_tick(NOON_MONDAY);
        assert!(!controller.is_heating());
        let events: Vec<ControllerEvent> = controller.drain_events().collect();
        assert_eq!(
            events,
            vec![
                ControllerEvent::BoostExpired,
                ControllerEvent::IsHeatingChanged(false),
            ]
        );
        assert!(controller.heating_enabled());

        controller.take_broadcast();
        controller.schedule_tick(NOON_MONDAY);
        assert!(controller.take_broadcast().is_none());
    }

    #[test]
    fn minute_rollover_marks_dirty_and_reevaluates() {
        let mut controller = controller();

        controller.schedule_tick(NOON_MONDAY);
        assert!(controller.take_broadcast().is_none());

        controller.schedule_tick(CurrentTime::new(DayOfWeek::Mon, 390));
        assert!(controller.is_heating());
        let status = controller.take_broadcast().unwrap();
        assert_eq!(status.current_time, 390);
        assert_eq!(status.current_day, 1);
        assert!(status.is_heating);
    }

    #[test]
    fn relay_follows_decision_in_stages() {
        let mut controller = controller();
        controller.schedule_tick(CurrentTime::new(DayOfWeek::Tue, 400));

        assert_eq!(controller.relay_tick(), RelayState::Pulsing.outputs());
        assert_eq!(controller.relay_tick(), RelayState::Held.outputs());
        assert_eq!(controller.relay_tick(), RelayState::Held.outputs());

        controller.schedule_tick(CurrentTime::new(DayOfWeek::Tue, 450));
        assert_eq!(controller.relay_tick(), RelayOutputs::default());
        assert_eq!(controller.relay_state(), RelayState::Off);
    }

    #[test]
    fn subscriber_attach_forces_a_broadcast() {
        let mut controller = controller();
        assert!(controller.take_broadcast().is_none());

        controller.attach_subscriber();
        let status = controller.take_broadcast().unwrap();
        assert_eq!(status.timers.len(), SLOT_COUNT);
    }

    #[test]
    fn get_status_is_read_only() {
        let mut controller = controller();
        let reply = controller.execute(ApiRequest::GetStatus).unwrap();

        assert_eq!(reply, ApiReply::Status(controller.status()));
        assert!(controller.take_broadcast().is_none());
        assert_eq!(controller.store().commits(), 0);
    }
}
