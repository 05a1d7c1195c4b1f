// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! The snapshot model returned by the archiver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::TagMap;

/// One archiver snapshot, as parsed from `snapshots --json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub short_id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub hostname: String,
    /// Tags in their wire form, `"key=value"` strings.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

impl Snapshot {
    /// The tags as a key/value map; tags without `=` are ignored.
    pub fn tag_map(&self) -> TagMap {
        self.tags
            .iter()
            .filter_map(|tag| tag.split_once('='))
            .map(|(key, value)| (key.to_owned(), value.to_owned()))
            .collect()
    }

    /// One tag value, if present.
    pub fn tag(&self, key: &str) -> Option<String> {
        self.tags
            .iter()
            .filter_map(|tag| tag.split_once('='))
            .find(|(tag_key, _)| *tag_key == key)
            .map(|(_, value)| value.to_owned())
    }

    /// Whether every `key=value` pair of the filter appears in this
    /// snapshot's tag set (the archiver's AND filter semantics).
    pub fn matches(&self, filter: &TagMap) -> bool {
        let tags = self.tag_map();
        filter
            .iter()
            .all(|(key, value)| tags.get(key) == Some(value))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use hasteward_test_utils::utc;

    use super::*;

    fn snapshot(tags: &[&str]) -> Snapshot {
        Snapshot {
            id: "ab12cd34ef".to_owned(),
            short_id: "ab12cd34".to_owned(),
            time: utc("2024-07-01T12:00:00Z"),
            hostname: String::new(),
            tags: tags.iter().map(|tag| (*tag).to_owned()).collect(),
            paths: vec!["prod/orders-db/pgdumpall.sql".to_owned()],
        }
    }

    #[test]
    fn tags_round_trip_through_filters() {
        let written: BTreeMap<String, String> = [
            ("engine", "postgres"),
            ("cluster", "orders-db"),
            ("namespace", "prod"),
            ("type", "backup"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect();
        let wire_tags: Vec<String> = written
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        let snapshot = snapshot(&wire_tags.iter().map(String::as_str).collect::<Vec<_>>());

        // A snapshot written with tags T matches a filter of exactly T.
        assert!(snapshot.matches(&written));
        assert_eq!(snapshot.tag_map(), written);
    }

    #[test]
    fn filter_is_conjunctive() {
        let snapshot = snapshot(&["engine=postgres", "type=backup"]);
        let mut filter = TagMap::new();
        filter.insert("engine".to_owned(), "postgres".to_owned());
        assert!(snapshot.matches(&filter));

        filter.insert("type".to_owned(), "diverged".to_owned());
        assert!(!snapshot.matches(&filter));
    }

    #[test]
    fn parses_archiver_json() {
        let raw = r#"[{
            "id": "f1e2d3c4b5a69788",
            "short_id": "f1e2d3c4",
            "time": "2024-07-01T12:00:00Z",
            "hostname": "hasteward",
            "tags": ["engine=galera", "type=diverged", "job=20240701T120000Z"],
            "paths": ["/prod/gdb/0-mysqldump.sql"]
        }]"#;
        let parsed: Vec<Snapshot> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].tag("job").as_deref(), Some("20240701T120000Z"));
        assert_eq!(parsed[0].time, utc("2024-07-01T12:00:00Z"));
    }
}
