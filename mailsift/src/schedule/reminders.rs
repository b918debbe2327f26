//! Reminder time calculation.

use chrono::{DateTime, Duration, NaiveTime, Utc};

use crate::analysis::Importance;

/// Offsets at which reminders are created for an entry.
#[derive(Debug, Clone)]
pub struct ReminderPolicy {
    /// Day offsets for important entries, fired at `morning_hour`.
    pub important_days_before: Vec<i64>,
    /// Hour offsets for important entries, fired exactly.
    pub important_hours_before: Vec<i64>,
    /// Day offsets for normal entries, fired at `morning_hour`.
    pub normal_days_before: Vec<i64>,
    pub morning_hour: u32,
}

impl Default for ReminderPolicy {
    fn default() -> Self {
        Self {
            important_days_before: vec![3, 1],
            important_hours_before: vec![1],
            normal_days_before: vec![1],
            morning_hour: 9,
        }
    }
}

impl ReminderPolicy {
    fn morning_of(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let time = NaiveTime::from_hms_opt(self.morning_hour, 0, 0)?;
        Some(t.date_naive().and_time(time).and_utc())
    }

    /// Reminder times for an entry starting at `start`, keeping only those after `now`.
    pub fn reminder_times(
        &self,
        start: DateTime<Utc>,
        importance: Importance,
        now: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        let (days, hours): (&[i64], &[i64]) = match importance {
            Importance::Important => (&self.important_days_before, &self.important_hours_before),
            Importance::Normal => (&self.normal_days_before, &[]),
            Importance::Unimportant => (&[], &[]),
        };

        let mut times: Vec<DateTime<Utc>> = days
            .iter()
            .filter_map(|d| self.morning_of(start - Duration::days(*d)))
            .chain(hours.iter().map(|h| start - Duration::hours(*h)))
            .filter(|t| *t > now)
            .collect();
        times.sort();
        times.dedup();
        times
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_important_entry_gets_three_reminders() {
        let policy = ReminderPolicy::default();
        let start = Utc.with_ymd_and_hms(2026, 5, 10, 14, 30, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();

        let times = policy.reminder_times(start, Importance::Important, now);
        assert_eq!(
            times,
            vec![
                Utc.with_ymd_and_hms(2026, 5, 7, 9, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 5, 9, 9, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 5, 10, 13, 30, 0).unwrap(),
            ]
        );
    }

    #[test]
    fn test_past_times_are_dropped() {
        let policy = ReminderPolicy::default();
        let start = Utc.with_ymd_and_hms(2026, 5, 10, 14, 30, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 5, 9, 12, 0, 0).unwrap();

        let times = policy.reminder_times(start, Importance::Important, now);
        assert_eq!(times, vec![Utc.with_ymd_and_hms(2026, 5, 10, 13, 30, 0).unwrap()]);

        assert_eq!(
            policy.reminder_times(start, Importance::Normal, now),
            Vec::<DateTime<Utc>>::new()
        );
    }

    #[test]
    fn test_unimportant_has_no_reminders() {
        let policy = ReminderPolicy::default();
        let start = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        assert!(
            policy
                .reminder_times(start, Importance::Unimportant, Utc::now())
                .is_empty()
        );
    }
}
