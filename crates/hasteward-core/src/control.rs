// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Engine-specific control-state records and their text parsers.
//!
//! Everything an instance reveals about its data position arrives as plain
//! text: `pg_controldata` output, `grastate.dat`, wsrep status rows, `df`
//! output, and pod logs. The parsers here are total; missing or malformed
//! fields become `None` or the engine's sentinel value rather than errors,
//! since partial evidence is still evidence.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Provenance of a control-state record, in decreasing order of trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateSource {
    /// Read by exec into a live, ready instance container.
    LiveExec,
    /// Read by exec into a running but not-ready (crash-looping) container.
    CrashloopExec,
    /// Read by an ephemeral probe pod mounting the stranded data volume.
    OfflineProbe,
    /// No record could be obtained.
    Absent,
}

impl StateSource {
    /// Whether any record was obtained at all.
    pub fn has_data(&self) -> bool {
        !matches!(self, Self::Absent)
    }
}

impl fmt::Display for StateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::LiveExec => "live-exec",
            Self::CrashloopExec => "crashloop-exec",
            Self::OfflineProbe => "offline-probe",
            Self::Absent => "absent",
        };
        f.write_str(label)
    }
}

/// A PostgreSQL log sequence number.
///
/// The textual form is a `"hi/lo"` pair of hex words; the comparable value
/// is `hi * 2^32 + lo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Parses the `"hi/lo"` hex representation. Returns `None` for empty or
    /// malformed input.
    pub fn parse(text: &str) -> Option<Self> {
        let (hi, lo) = text.trim().split_once('/')?;
        let hi = u64::from_str_radix(hi, 16).ok()?;
        let lo = u64::from_str_radix(lo, 16).ok()?;
        Some(Self((hi << 32) + lo))
    }

    /// The comparable value; unknown LSNs compare as zero.
    pub fn value(lsn: Option<Lsn>) -> u64 {
        lsn.map_or(0, |lsn| lsn.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// Fields extracted from `pg_controldata` output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgControlData {
    pub cluster_state: Option<String>,
    pub timeline: Option<u32>,
    pub checkpoint_lsn: Option<Lsn>,
    pub checkpoint_time: Option<String>,
    pub min_recovery_end: Option<String>,
}

impl PgControlData {
    /// Parses the line-oriented `pg_controldata` output.
    pub fn parse(raw: &str) -> Self {
        let mut data = Self::default();
        for line in raw.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "Database cluster state" => data.cluster_state = Some(value.to_owned()),
                "Latest checkpoint's TimeLineID" => data.timeline = value.parse().ok(),
                "Latest checkpoint location" => data.checkpoint_lsn = Lsn::parse(value),
                "Time of latest checkpoint" => data.checkpoint_time = Some(value.to_owned()),
                "Min recovery ending location" => data.min_recovery_end = Some(value.to_owned()),
                _ => {}
            }
        }
        data
    }
}

/// The all-zero group UUID written into a freshly reset `grastate.dat`.
pub const ZERO_UUID: &str = "00000000-0000-0000-0000-000000000000";

/// Fields extracted from a Galera `grastate.dat` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grastate {
    pub uuid: Option<String>,
    /// Commit position; `-1` means undetermined (crashed or reset).
    pub seqno: i64,
    pub safe_to_bootstrap: bool,
}

impl Default for Grastate {
    fn default() -> Self {
        Self {
            uuid: None,
            seqno: -1,
            safe_to_bootstrap: false,
        }
    }
}

impl Grastate {
    /// Parses the `key: value` lines of a `grastate.dat` file.
    pub fn parse(raw: &str) -> Self {
        let mut state = Self::default();
        for line in raw.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "uuid" => state.uuid = Some(value.to_owned()),
                "seqno" => state.seqno = value.parse().unwrap_or(-1),
                "safe_to_bootstrap" => state.safe_to_bootstrap = value == "1",
                _ => {}
            }
        }
        state
    }

    /// Whether the recorded group UUID identifies an actual cluster state.
    pub fn has_known_uuid(&self) -> bool {
        self.uuid.as_deref().is_some_and(|uuid| uuid != ZERO_UUID)
    }
}

/// Wsrep global status variables of a running Galera node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsrepStatus {
    /// `wsrep_local_state`: 0..4, where 4 is Synced.
    pub local_state: Option<u8>,
    pub local_state_comment: Option<String>,
    /// `wsrep_cluster_status`: `Primary`, `non-Primary`, `Disconnected`, ...
    pub cluster_status: Option<String>,
    pub cluster_size: Option<u32>,
    /// `wsrep_connected` mapped from `ON`/`OFF`.
    pub connected: Option<bool>,
    /// `wsrep_ready` mapped from `ON`/`OFF`.
    pub ready: Option<bool>,
    pub cluster_state_uuid: Option<String>,
    /// `wsrep_last_committed`; `-1` when unreported.
    pub last_committed: i64,
    pub flow_control_paused: Option<String>,
}

impl WsrepStatus {
    /// Synced local state value.
    pub const SYNCED: u8 = 4;

    /// Parses tab-separated `VARIABLE_NAME\tVARIABLE_VALUE` rows as produced
    /// by a batch `GLOBAL_STATUS` query.
    pub fn parse(raw: &str) -> Self {
        let mut status = Self {
            last_committed: -1,
            ..Self::default()
        };
        for line in raw.lines() {
            let Some((key, value)) = line.trim().split_once('\t') else {
                continue;
            };
            match key.to_ascii_lowercase().as_str() {
                "wsrep_local_state" => status.local_state = value.parse().ok(),
                "wsrep_local_state_comment" => {
                    status.local_state_comment = Some(value.to_owned());
                }
                "wsrep_cluster_status" => status.cluster_status = Some(value.to_owned()),
                "wsrep_cluster_size" => status.cluster_size = value.parse().ok(),
                "wsrep_connected" => status.connected = Some(value == "ON"),
                "wsrep_ready" => status.ready = Some(value == "ON"),
                "wsrep_cluster_state_uuid" => {
                    status.cluster_state_uuid = Some(value.to_owned());
                }
                "wsrep_last_committed" => status.last_committed = value.parse().unwrap_or(-1),
                "wsrep_flow_control_paused" => {
                    status.flow_control_paused = Some(value.to_owned());
                }
                _ => {}
            }
        }
        status
    }

    /// Whether the node reports membership in the primary component.
    pub fn in_primary_component(&self) -> bool {
        self.cluster_status.as_deref() == Some("Primary")
    }

    /// Whether the node is fully synced and serving.
    pub fn is_synced(&self) -> bool {
        self.local_state == Some(Self::SYNCED)
            && self.connected == Some(true)
            && self.ready == Some(true)
            && self.in_primary_component()
    }
}

/// A `pg_stat_replication` row as reported by the primary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationRow {
    pub client_addr: String,
    pub state: String,
    pub sent_lsn: Option<Lsn>,
    pub write_lsn: Option<Lsn>,
    pub flush_lsn: Option<Lsn>,
    pub replay_lsn: Option<Lsn>,
    pub write_lag: String,
    pub flush_lag: String,
    pub replay_lag: String,
    pub application_name: String,
}

impl ReplicationRow {
    /// Parses one pipe-separated row of the replication query output.
    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() < 10 {
            return None;
        }
        Some(Self {
            client_addr: fields[0].to_owned(),
            state: fields[1].to_owned(),
            sent_lsn: Lsn::parse(fields[2]),
            write_lsn: Lsn::parse(fields[3]),
            flush_lsn: Lsn::parse(fields[4]),
            replay_lsn: Lsn::parse(fields[5]),
            write_lag: fields[6].to_owned(),
            flush_lag: fields[7].to_owned(),
            replay_lag: fields[8].to_owned(),
            application_name: fields[9].to_owned(),
        })
    }

    pub fn is_streaming(&self) -> bool {
        self.state == "streaming"
    }
}

/// A `pg_replication_slots` row as reported by the primary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationSlotRow {
    pub slot_name: String,
    pub slot_type: String,
    pub active: bool,
    pub restart_lsn: Option<Lsn>,
    pub confirmed_flush_lsn: Option<Lsn>,
    pub bytes_behind: Option<i64>,
}

impl ReplicationSlotRow {
    /// Parses one pipe-separated row of the replication-slot query output.
    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() < 6 {
            return None;
        }
        Some(Self {
            slot_name: fields[0].to_owned(),
            slot_type: fields[1].to_owned(),
            active: fields[2] == "t" || fields[2] == "true",
            restart_lsn: Lsn::parse(fields[3]),
            confirmed_flush_lsn: Lsn::parse(fields[4]),
            bytes_behind: fields[5].trim().parse().ok(),
        })
    }
}

/// Parses the used-percent column from `df -h <path>` output.
pub fn parse_disk_percent(df_output: &str) -> Option<u8> {
    let line = df_output.trim().lines().last()?;
    let used = line.split_whitespace().nth(4)?;
    used.strip_suffix('%')?.parse().ok()
}

/// Token sets indicating a disk-full crash in database container logs.
const DISK_FULL_TOKENS: &[&str] = &[
    "no space left on device",
    "disk is full",
    "disk full",
    "low-disk space condition",
    "low disk space",
];

/// Scans container log text for evidence of a disk-full crash.
pub fn detect_disk_full(log: &str) -> bool {
    let log = log.to_ascii_lowercase();
    DISK_FULL_TOKENS.iter().any(|token| log.contains(token))
}

#[cfg(test)]
mod tests {
    use hasteward_test_utils::param_test;

    use super::*;

    param_test! {
        lsn_parsing: [
            simple: ("0/A0", Some(0xA0)),
            high_word: ("2/1000", Some((2u64 << 32) + 0x1000)),
            with_spaces: ("  0/99 ", Some(0x99)),
            empty: ("", None),
            no_separator: ("DEADBEEF", None),
            not_hex: ("0/XYZ", None),
        ]
    }
    fn lsn_parsing(text: &str, expected: Option<u64>) {
        assert_eq!(Lsn::parse(text), expected.map(Lsn));
    }

    #[test]
    fn lsn_displays_as_hex_pair() {
        let lsn = Lsn::parse("3/4B2F1D0").unwrap();
        assert_eq!(lsn.to_string(), "3/4B2F1D0");
    }

    #[test]
    fn controldata_parsing() {
        let raw = "\
pg_control version number:            1300
Database cluster state:               in archive recovery
Latest checkpoint location:           0/6000028
Latest checkpoint's TimeLineID:       5
Time of latest checkpoint:            Mon 01 Jul 2024 11:58:03 AM UTC
Min recovery ending location:         0/60000F8
";
        let data = PgControlData::parse(raw);
        assert_eq!(data.cluster_state.as_deref(), Some("in archive recovery"));
        assert_eq!(data.timeline, Some(5));
        assert_eq!(data.checkpoint_lsn, Lsn::parse("0/6000028"));
        assert_eq!(data.min_recovery_end.as_deref(), Some("0/60000F8"));
    }

    #[test]
    fn controldata_missing_fields_are_none() {
        let data = PgControlData::parse("garbage output\nwithout colons either");
        assert_eq!(data, PgControlData::default());
    }

    #[test]
    fn grastate_parsing() {
        let raw = "\
# GALERA saved state
version: 2.1
uuid:    7acce8c4-9a2f-11ee-8b4d-7f3f2a6b8d21
seqno:   1042
safe_to_bootstrap: 1
";
        let state = Grastate::parse(raw);
        assert_eq!(
            state.uuid.as_deref(),
            Some("7acce8c4-9a2f-11ee-8b4d-7f3f2a6b8d21")
        );
        assert_eq!(state.seqno, 1042);
        assert!(state.safe_to_bootstrap);
        assert!(state.has_known_uuid());
    }

    param_test! {
        grastate_sentinels: [
            undetermined_seqno: ("uuid: abc\nseqno: -1\n", -1, false),
            malformed_seqno: ("seqno: not-a-number\n", -1, false),
            bootstrap_zero: ("seqno: 7\nsafe_to_bootstrap: 0\n", 7, false),
        ]
    }
    fn grastate_sentinels(raw: &str, seqno: i64, bootstrap: bool) {
        let state = Grastate::parse(raw);
        assert_eq!(state.seqno, seqno);
        assert_eq!(state.safe_to_bootstrap, bootstrap);
    }

    #[test]
    fn zero_uuid_is_not_known() {
        let state = Grastate::parse(&format!("uuid: {ZERO_UUID}\nseqno: 3\n"));
        assert!(!state.has_known_uuid());
    }

    #[test]
    fn wsrep_parsing() {
        let raw = "\
WSREP_CLUSTER_SIZE\t3
WSREP_CLUSTER_STATE_UUID\t7acce8c4-9a2f-11ee-8b4d-7f3f2a6b8d21
WSREP_CLUSTER_STATUS\tPrimary
WSREP_CONNECTED\tON
WSREP_LAST_COMMITTED\t150
WSREP_LOCAL_STATE\t4
WSREP_LOCAL_STATE_COMMENT\tSynced
WSREP_READY\tON
";
        let status = WsrepStatus::parse(raw);
        assert_eq!(status.local_state, Some(4));
        assert_eq!(status.cluster_size, Some(3));
        assert_eq!(status.connected, Some(true));
        assert_eq!(status.last_committed, 150);
        assert!(status.in_primary_component());
        assert!(status.is_synced());
    }

    #[test]
    fn wsrep_disconnected_is_not_synced() {
        let status = WsrepStatus::parse("wsrep_local_state\t4\nwsrep_connected\tOFF\n");
        assert!(!status.is_synced());
        assert_eq!(status.last_committed, -1);
    }

    #[test]
    fn replication_row_parsing() {
        let line = "10.0.4.2|streaming|0/A0|0/A0|0/A0|0/9E|00:00:00.1|00:00:00.2|00:00:00.3|db-2";
        let row = ReplicationRow::parse(line).unwrap();
        assert!(row.is_streaming());
        assert_eq!(row.application_name, "db-2");
        assert_eq!(row.replay_lsn, Lsn::parse("0/9E"));
        assert!(ReplicationRow::parse("short|row").is_none());
    }

    #[test]
    fn slot_row_parsing() {
        let line = "_cnpg_db_2|physical|t|0/9E|0/9E|512";
        let row = ReplicationSlotRow::parse(line).unwrap();
        assert!(row.active);
        assert_eq!(row.bytes_behind, Some(512));
    }

    param_test! {
        disk_percent_parsing: [
            typical: (
                "Filesystem  Size  Used Avail Use% Mounted on\n/dev/sdb1   20G   18G  1.1G  95% /var/lib/mysql",
                Some(95),
            ),
            empty: ("", None),
            malformed: ("just one line", None),
        ]
    }
    fn disk_percent_parsing(output: &str, expected: Option<u8>) {
        assert_eq!(parse_disk_percent(output), expected);
    }

    param_test! {
        disk_full_detection: [
            postgres_token: ("PANIC: could not write: low-disk space condition", true),
            galera_token: ("[ERROR] mariadbd: Disk is full writing './galera.cache'", true),
            generic_token: ("write failed: No space left on device", true),
            healthy_log: ("database system is ready to accept connections", false),
        ]
    }
    fn disk_full_detection(log: &str, expected: bool) {
        assert_eq!(detect_disk_full(log), expected);
    }
}
