//! Dense per-area daily series.

use chrono::{Days, NaiveDate};

use crate::models::{area::AreaType, payload::Derived};

/// Identity of one series: one metric (and optionally one band) for one area.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    /// Geographic level.
    pub area_type: AreaType,
    /// Area code.
    pub area_code: String,
    /// Canonical metric name.
    pub metric: String,
    /// Demographic band, if the metric is nested.
    pub band: Option<String>,
}

/// A contiguous daily series starting at `start`.
///
/// `values[i]` and `derived[i]` describe `start + i` days; both vectors always have the same
/// length, so there are no date gaps by construction.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaSeries {
    /// Series identity.
    pub key: SeriesKey,
    /// Repaired area name (filled by the normalizer).
    pub area_name: Option<String>,
    /// First calendar day.
    pub start: NaiveDate,
    /// One value per day; `None` means nothing observed.
    pub values: Vec<Option<f64>>,
    /// Derived statistics per day.
    pub derived: Vec<Derived>,
}

impl AreaSeries {
    /// An all-null series of `len` days.
    pub fn empty(key: SeriesKey, start: NaiveDate, len: usize) -> Self {
        Self {
            key,
            area_name: None,
            start,
            values: vec![None; len],
            derived: vec![Derived::default(); len],
        }
    }

    /// Number of days covered.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when the series covers no days.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Calendar date of position `i`.
    pub fn date_at(&self, i: usize) -> NaiveDate {
        self.start + Days::new(i as u64)
    }

    /// Position of `date`, if inside the series.
    pub fn index_of(&self, date: NaiveDate) -> Option<usize> {
        let offset = date.signed_duration_since(self.start).num_days();
        usize::try_from(offset).ok().filter(|&i| i < self.len())
    }

    /// Inclusive index span between the first and last non-null values.
    pub fn observed_span(&self) -> Option<(usize, usize)> {
        let first = self.values.iter().position(Option::is_some)?;
        let last = self.values.iter().rposition(Option::is_some)?;
        Some((first, last))
    }

    /// Last date carrying a non-null value.
    pub fn last_observed_date(&self) -> Option<NaiveDate> {
        self.observed_span().map(|(_, last)| self.date_at(last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SeriesKey {
        SeriesKey {
            area_type: AreaType::Utla,
            area_code: "E06000001".into(),
            metric: "newCasesByPublishDate".into(),
            band: None,
        }
    }

    #[test]
    fn index_and_date_agree() {
        let start = NaiveDate::from_ymd_opt(2020, 2, 27).unwrap();
        let s = AreaSeries::empty(key(), start, 5);
        let d = NaiveDate::from_ymd_opt(2020, 3, 1).unwrap(); // crosses a leap day
        let i = s.index_of(d).unwrap();
        assert_eq!(i, 3);
        assert_eq!(s.date_at(i), d);
        assert_eq!(s.index_of(NaiveDate::from_ymd_opt(2020, 2, 26).unwrap()), None);
        assert_eq!(s.index_of(NaiveDate::from_ymd_opt(2020, 3, 3).unwrap()), None);
    }

    #[test]
    fn observed_span_skips_leading_and_trailing_nulls() {
        let start = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap();
        let mut s = AreaSeries::empty(key(), start, 6);
        s.values = vec![None, Some(1.0), None, Some(2.0), None, None];
        assert_eq!(s.observed_span(), Some((1, 3)));
        assert_eq!(
            s.last_observed_date(),
            NaiveDate::from_ymd_opt(2021, 1, 4)
        );
        assert_eq!(AreaSeries::empty(key(), start, 3).observed_span(), None);
    }
}
