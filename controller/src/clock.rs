use chrono::{NaiveDateTime, TimeDelta, Utc};
use chrono_tz::Tz;

use hotwater_common::{DateTimeParts, HardwareClock};

/// Wall clock in a fixed IANA timezone. `set` shifts it away from the
/// system time and stays shifted until set again.
#[derive(Debug, Clone)]
pub struct SystemClock {
    timezone: Tz,
    offset: TimeDelta,
}

impl SystemClock {
    pub fn new(timezone: &str) -> anyhow::Result<Self> {
        let timezone = timezone
            .parse::<Tz>()
            .map_err(|err| anyhow::anyhow!("unknown timezone `{timezone}`: {err}"))?;
        Ok(Self {
            timezone,
            offset: TimeDelta::zero(),
        })
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    fn local_now(&self) -> NaiveDateTime {
        (Utc::now() + self.offset)
            .with_timezone(&self.timezone)
            .naive_local()
    }
}

impl HardwareClock for SystemClock {
    fn now(&self) -> DateTimeParts {
        DateTimeParts::from_naive(self.local_now())
    }

    fn set(&mut self, value: DateTimeParts) {
        let Some(target) = value.to_naive() else {
            return;
        };
        self.offset = self.offset + (target - self.local_now());
    }
}

/// Parses `YYYY-MM-DDTHH:MM` as used by `HOTWATER_CLOCK_START`.
pub fn parse_clock_start(raw: &str) -> anyhow::Result<DateTimeParts> {
    let value = NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%dT%H:%M")
        .map_err(|err| anyhow::anyhow!("invalid clock start `{raw}`: {err}"))?;
    Ok(DateTimeParts::from_naive(value))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn set_moves_the_reading() {
        let mut clock = SystemClock::new("Europe/London").unwrap();
        let target = parse_clock_start("2026-10-17T06:30").unwrap();

        clock.set(target);
        let now = clock.now();

        assert_eq!((now.year, now.month, now.day), (2026, 10, 17));
        assert_eq!(now.hour, 6);
        assert!(now.minute == 30 || now.minute == 31);
    }

    #[test]
    fn rejects_unknown_timezone() {
        assert!(SystemClock::new("Mars/Olympus").is_err());
    }

    #[test]
    fn rejects_bad_clock_start() {
        assert!(parse_clock_start("17/10/2026").is_err());
    }
}
