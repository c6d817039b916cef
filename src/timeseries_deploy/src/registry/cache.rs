//! Lock-free, read-mostly cache of metric name -> metric id.
//!
//! Readers call [`MetricIdCache::get`], which loads an `Arc<HashMap<..>>` snapshot with no
//! locking. Writers call [`MetricIdCache::refresh`] after registering metrics, or
//! [`MetricIdCache::insert`] for a single new id; readers see either the old or the new
//! snapshot.
//!
//! Metric ids never change once assigned, so a stale snapshot can only miss entries, never
//! return a wrong id.

use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use diesel::SqliteConnection;

use super::repo::load_metric_ids;

type MetricIds = HashMap<String, i32>;

/// Shared snapshot cache of metric ids. Starts empty.
#[derive(Debug)]
pub struct MetricIdCache {
    ids: ArcSwap<MetricIds>,
}

impl Default for MetricIdCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricIdCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self {
            ids: ArcSwap::from_pointee(MetricIds::new()),
        }
    }

    /// Cached id for `metric`, if known.
    pub fn get(&self, metric: &str) -> Option<i32> {
        self.ids.load().get(metric).copied()
    }

    /// Add one id, keeping everything else in the snapshot.
    pub fn insert(&self, metric: &str, id: i32) {
        self.ids.rcu(|current| {
            let mut next = MetricIds::clone(current);
            next.insert(metric.to_string(), id);
            next
        });
    }

    /// Rebuild the snapshot from the database and swap it in.
    pub fn refresh(&self, conn: &mut SqliteConnection) -> anyhow::Result<usize> {
        let ids = load_metric_ids(conn)?;
        let n = ids.len();
        self.ids.store(Arc::new(ids));
        Ok(n)
    }

    /// Number of cached metrics.
    pub fn len(&self) -> usize {
        self.ids.load().len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.ids.load().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{connection::connect_sqlite, migrate},
        registry::repo::get_or_create_metric,
    };

    #[test]
    fn refresh_and_insert() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_string_lossy().to_string();
        migrate::run_sqlite(&path).unwrap();
        let mut conn = connect_sqlite(&path).unwrap();

        let cache = MetricIdCache::new();
        assert!(cache.get("newCasesByPublishDate").is_none());

        let (id, _) = get_or_create_metric(&mut conn, "newCasesByPublishDate").unwrap();
        assert_eq!(cache.refresh(&mut conn).unwrap(), 1);
        assert_eq!(cache.get("newCasesByPublishDate"), Some(id));

        cache.insert("cumCasesByPublishDate", 99);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("newCasesByPublishDate"), Some(id));
    }
}
