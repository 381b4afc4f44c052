//! Durable log of autopilot decisions.
//!
//! Decision types and statuses are opaque strings here; the autopilot crate
//! owns their meaning. Every status change is a conditional UPDATE on the
//! expected current status, so a running autopilot and an operator's
//! `approve` in another process cannot both win.

use chrono::{DateTime, Utc};
use leadpulse_core::error::Result;
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::persistence::{SchedulerDb, from_ms, store_err, to_ms};

/// One stored decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    pub decision_type: String,
    pub rule: String,
    /// Identifies "the same decision" across rule passes.
    pub fingerprint: String,
    pub reasoning: String,
    pub action: serde_json::Value,
    pub confidence: f64,
    pub status: String,
    /// Handle of the in-flight application (a task id for queued execution).
    pub execution_ref: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Columns written alongside a status change. `None` keeps the stored value.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionUpdate<'a> {
    pub execution_ref: Option<&'a str>,
    pub error: Option<&'a str>,
    pub confidence: Option<f64>,
}

const DECISION_SELECT: &str = "SELECT id, decision_type, rule, fingerprint, reasoning, action, confidence, status, execution_ref, error, created_at, updated_at FROM decisions";

fn row_to_decision(row: &Row) -> rusqlite::Result<DecisionRecord> {
    let action: String = row.get(5)?;
    Ok(DecisionRecord {
        id: row.get(0)?,
        decision_type: row.get(1)?,
        rule: row.get(2)?,
        fingerprint: row.get(3)?,
        reasoning: row.get(4)?,
        action: serde_json::from_str(&action).unwrap_or_default(),
        confidence: row.get(6)?,
        status: row.get(7)?,
        execution_ref: row.get(8)?,
        error: row.get(9)?,
        created_at: from_ms(row.get(10)?),
        updated_at: from_ms(row.get(11)?),
    })
}

/// Status set as a JSON array, matched with `json_each`.
fn status_set(statuses: &[&str]) -> String {
    serde_json::Value::from(statuses.to_vec()).to_string()
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl SchedulerDb {
    pub fn insert_decision(&self, d: &DecisionRecord) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO decisions
                 (id, decision_type, rule, fingerprint, reasoning, action, confidence, status,
                  execution_ref, error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    d.id,
                    d.decision_type,
                    d.rule,
                    d.fingerprint,
                    d.reasoning,
                    d.action.to_string(),
                    d.confidence,
                    d.status,
                    d.execution_ref,
                    d.error,
                    to_ms(d.created_at),
                    to_ms(d.updated_at),
                ],
            )
            .map_err(store_err("Insert decision"))?;
        Ok(())
    }

    pub fn get_decision(&self, id: &str) -> Result<Option<DecisionRecord>> {
        self.conn()
            .query_row(&format!("{DECISION_SELECT} WHERE id = ?1"), [id], row_to_decision)
            .optional()
            .map_err(store_err("Get decision"))
    }

    /// Decisions in `status`, oldest first.
    pub fn decisions_with_status(&self, status: &str, limit: usize) -> Result<Vec<DecisionRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!("{DECISION_SELECT} WHERE status = ?1 ORDER BY seq ASC LIMIT ?2"))
            .map_err(store_err("List decisions"))?;
        let rows = stmt
            .query_map(params![status, sql_limit(limit)], row_to_decision)
            .map_err(store_err("List decisions"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("List decisions"))
    }

    /// Most recent decisions, newest first.
    pub fn recent_decisions(&self, limit: usize) -> Result<Vec<DecisionRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!("{DECISION_SELECT} ORDER BY seq DESC LIMIT ?1"))
            .map_err(store_err("Recent decisions"))?;
        let rows = stmt
            .query_map([sql_limit(limit)], row_to_decision)
            .map_err(store_err("Recent decisions"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("Recent decisions"))
    }

    pub fn latest_decision_with_fingerprint(&self, fingerprint: &str) -> Result<Option<DecisionRecord>> {
        self.conn()
            .query_row(
                &format!("{DECISION_SELECT} WHERE fingerprint = ?1 ORDER BY seq DESC LIMIT 1"),
                [fingerprint],
                row_to_decision,
            )
            .optional()
            .map_err(store_err("Decision by fingerprint"))
    }

    pub fn count_decisions(&self, status: &str) -> Result<usize> {
        let n: i64 = self
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM decisions WHERE status = ?1",
                [status],
                |row| row.get(0),
            )
            .map_err(store_err("Count decisions"))?;
        Ok(n as usize)
    }

    /// Move a decision to `to` if its current status is one of `from`.
    /// Returns false when it was not (or does not exist).
    pub fn update_decision(
        &self,
        id: &str,
        from: &[&str],
        to: &str,
        update: DecisionUpdate<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "UPDATE decisions
                 SET status = ?1,
                     execution_ref = COALESCE(?2, execution_ref),
                     error = COALESCE(?3, error),
                     confidence = COALESCE(?4, confidence),
                     updated_at = ?5
                 WHERE id = ?6 AND status IN (SELECT value FROM json_each(?7))",
                params![
                    to,
                    update.execution_ref,
                    update.error,
                    update.confidence,
                    to_ms(now),
                    id,
                    status_set(from),
                ],
            )
            .map_err(store_err("Update decision"))?;
        Ok(changed == 1)
    }

    /// Move every `from` decision created before `created_before` to `to`.
    pub fn expire_decisions(
        &self,
        from: &str,
        to: &str,
        created_before: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        self.conn()
            .execute(
                "UPDATE decisions SET status = ?2, error = ?3, updated_at = ?4
                 WHERE status = ?1 AND created_at < ?5",
                params![from, to, error, to_ms(now), to_ms(created_before)],
            )
            .map_err(store_err("Expire decisions"))
    }

    /// Keep the newest `keep` decisions in `from`; move the older ones to `to`.
    pub fn cap_decisions(
        &self,
        from: &str,
        to: &str,
        keep: usize,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        self.conn()
            .execute(
                "UPDATE decisions SET status = ?2, error = ?3, updated_at = ?4
                 WHERE status = ?1 AND seq NOT IN (
                     SELECT seq FROM decisions WHERE status = ?1 ORDER BY seq DESC LIMIT ?5
                 )",
                params![from, to, error, to_ms(now), sql_limit(keep)],
            )
            .map_err(store_err("Cap decisions"))
    }

    /// Delete all but the newest `keep` decisions whose status is in `statuses`.
    pub fn prune_decisions(&self, statuses: &[&str], keep: usize) -> Result<usize> {
        self.conn()
            .execute(
                "DELETE FROM decisions
                 WHERE status IN (SELECT value FROM json_each(?1))
                   AND seq NOT IN (
                       SELECT seq FROM decisions
                       WHERE status IN (SELECT value FROM json_each(?1))
                       ORDER BY seq DESC LIMIT ?2
                   )",
                params![status_set(statuses), sql_limit(keep)],
            )
            .map_err(store_err("Prune decisions"))
    }

    /// Learned confidence offset for a decision type (0 when none yet).
    pub fn decision_calibration(&self, decision_type: &str) -> Result<f64> {
        let offset: Option<f64> = self
            .conn()
            .query_row(
                "SELECT adjustment FROM decision_calibration WHERE decision_type = ?1",
                [decision_type],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err("Calibration"))?;
        Ok(offset.unwrap_or(0.0))
    }

    /// Add `delta` to the type's offset, clamped to `±bound`. Returns the new offset.
    pub fn adjust_decision_calibration(&self, decision_type: &str, delta: f64, bound: f64) -> Result<f64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO decision_calibration (decision_type, adjustment)
             VALUES (?1, MAX(-?3, MIN(?3, ?2)))
             ON CONFLICT(decision_type)
             DO UPDATE SET adjustment = MAX(-?3, MIN(?3, adjustment + ?2))",
            params![decision_type, delta, bound],
        )
        .map_err(store_err("Calibration"))?;
        conn.query_row(
            "SELECT adjustment FROM decision_calibration WHERE decision_type = ?1",
            [decision_type],
            |row| row.get(0),
        )
        .map_err(store_err("Calibration"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(id: &str, status: &str, at: DateTime<Utc>) -> DecisionRecord {
        DecisionRecord {
            id: id.into(),
            decision_type: "pause_campaign".into(),
            rule: "underperformer".into(),
            fingerprint: format!("pause_campaign:{id}"),
            reasoning: "low conversions".into(),
            action: serde_json::json!({"campaign_id": id}),
            confidence: 0.75,
            status: status.into(),
            execution_ref: None,
            error: None,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn test_insert_get_and_list() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let now = Utc::now();
        db.insert_decision(&record("d1", "pending_approval", now)).unwrap();
        db.insert_decision(&record("d2", "approved", now)).unwrap();
        db.insert_decision(&record("d3", "pending_approval", now)).unwrap();

        let d1 = db.get_decision("d1").unwrap().unwrap();
        assert_eq!(d1.action["campaign_id"], "d1");
        assert!(db.get_decision("nope").unwrap().is_none());

        let pending: Vec<String> = db
            .decisions_with_status("pending_approval", usize::MAX)
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(pending, vec!["d1", "d3"]);
        assert_eq!(db.recent_decisions(1).unwrap()[0].id, "d3");
        assert_eq!(db.count_decisions("approved").unwrap(), 1);
        assert_eq!(
            db.latest_decision_with_fingerprint("pause_campaign:d2").unwrap().unwrap().id,
            "d2"
        );
    }

    #[test]
    fn test_update_is_conditional_on_status() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let now = Utc::now();
        db.insert_decision(&record("d1", "approved", now)).unwrap();

        assert!(!db
            .update_decision("d1", &["pending_approval"], "rejected", DecisionUpdate::default(), now)
            .unwrap());
        let update = DecisionUpdate {
            execution_ref: Some("task-7"),
            ..Default::default()
        };
        assert!(db.update_decision("d1", &["approved"], "executing", update, now).unwrap());

        let update = DecisionUpdate {
            error: Some("crm said no"),
            confidence: Some(0.65),
            ..Default::default()
        };
        assert!(db
            .update_decision("d1", &["approved", "executing"], "failed", update, now)
            .unwrap());
        let d1 = db.get_decision("d1").unwrap().unwrap();
        assert_eq!(d1.status, "failed");
        assert_eq!(d1.execution_ref.as_deref(), Some("task-7"));
        assert_eq!(d1.error.as_deref(), Some("crm said no"));
        assert_eq!(d1.confidence, 0.65);
    }

    #[test]
    fn test_expire_cap_and_prune() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let now = Utc::now();
        db.insert_decision(&record("old", "pending_approval", now - Duration::days(10))).unwrap();
        for i in 0..4 {
            db.insert_decision(&record(&format!("p{i}"), "pending_approval", now)).unwrap();
        }
        assert_eq!(
            db.expire_decisions("pending_approval", "expired", now - Duration::days(7), "stale", now)
                .unwrap(),
            1
        );
        assert_eq!(db.cap_decisions("pending_approval", "expired", 2, "too many", now).unwrap(), 2);
        let left: Vec<String> = db
            .decisions_with_status("pending_approval", 10)
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(left, vec!["p2", "p3"]);

        assert_eq!(db.prune_decisions(&["expired", "failed"], 1).unwrap(), 2);
        assert_eq!(db.count_decisions("expired").unwrap(), 1);
        assert_eq!(db.count_decisions("pending_approval").unwrap(), 2);
    }

    #[test]
    fn test_calibration_accumulates_and_clamps() {
        let db = SchedulerDb::open_in_memory().unwrap();
        assert_eq!(db.decision_calibration("assign_agent").unwrap(), 0.0);
        let after = db.adjust_decision_calibration("assign_agent", -0.1, 0.5).unwrap();
        assert!((after + 0.1).abs() < 1e-9);
        for _ in 0..10 {
            db.adjust_decision_calibration("assign_agent", -0.1, 0.5).unwrap();
        }
        assert!((db.decision_calibration("assign_agent").unwrap() + 0.5).abs() < 1e-9);
        assert_eq!(db.decision_calibration("create_campaign").unwrap(), 0.0);
    }
}
