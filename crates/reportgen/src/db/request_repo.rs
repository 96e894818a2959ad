//! Request repository: persistence for `report_requests` and `sub_reports`.
//!
//! A request and its two sub-reports are always written in one transaction,
//! and deleting a request cascades to both sub-reports.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};
use crate::error::StoreError;
use crate::report::{ReportRequest, ReportStatus, SubReport, SubReportParts, TargetKind};
use crate::store::RequestStore;

/// A raw `report_requests` row.
#[derive(Debug, Clone)]
struct RequestRow {
    id: String,
    submitter: String,
    description: String,
    created_at: String,
    updated_at: String,
}

impl RequestRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            submitter: row.get("submitter")?,
            description: row.get("description")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// A raw `sub_reports` row.
#[derive(Debug, Clone)]
struct SubReportRow {
    target_kind: String,
    status: String,
    file_ref: Option<String>,
    file_size: Option<i64>,
    failure_reason: Option<String>,
    created_at: String,
    updated_at: String,
}

impl SubReportRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            target_kind: row.get("target_kind")?,
            status: row.get("status")?,
            file_ref: row.get("file_ref")?,
            file_size: row.get("file_size")?,
            failure_reason: row.get("failure_reason")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_sub_report(self, id: &str) -> Result<SubReport, DatabaseError> {
        let status = ReportStatus::parse(&self.status)
            .ok_or_else(|| invalid(id, format!("unknown status '{}'", self.status)))?;
        let file_size = self
            .file_size
            .map(|size| u64::try_from(size).map_err(|_| invalid(id, "negative file size")))
            .transpose()?;

        let parts = SubReportParts {
            status,
            file_ref: self.file_ref,
            file_size,
            failure_reason: self.failure_reason,
            created_time: parse_timestamp(&self.created_at, id)?,
            updated_time: parse_timestamp(&self.updated_at, id)?,
        };
        SubReport::try_from(parts).map_err(|reason| invalid(id, reason))
    }
}

fn invalid(id: &str, reason: impl Into<String>) -> DatabaseError {
    DatabaseError::InvalidRow {
        id: id.to_string(),
        reason: reason.into(),
    }
}

fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_timestamp(s: &str, id: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| invalid(id, format!("bad timestamp '{}': {}", s, e)))
}

fn size_to_sql(id: &str, size: Option<u64>) -> Result<Option<i64>, DatabaseError> {
    size.map(|s| i64::try_from(s).map_err(|_| invalid(id, "file size exceeds i64")))
        .transpose()
}

// ─── Connection-level helpers ───────────────────────────────────────────────

fn load(conn: &Connection, id: &str) -> Result<Option<ReportRequest>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, submitter, description, created_at, updated_at
             FROM report_requests WHERE id = ?1",
            params![id],
            RequestRow::from_row,
        )
        .optional()?;

    match row {
        Some(row) => Ok(Some(assemble(conn, row)?)),
        None => Ok(None),
    }
}

fn assemble(conn: &Connection, row: RequestRow) -> Result<ReportRequest, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT target_kind, status, file_ref, file_size, failure_reason, created_at, updated_at
         FROM sub_reports WHERE request_id = ?1",
    )?;
    let sub_rows = stmt
        .query_map(params![row.id], SubReportRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut pdf = None;
    let mut excel = None;
    for sub_row in sub_rows {
        match TargetKind::parse(&sub_row.target_kind) {
            Some(TargetKind::Pdf) => pdf = Some(sub_row.into_sub_report(&row.id)?),
            Some(TargetKind::Excel) => excel = Some(sub_row.into_sub_report(&row.id)?),
            None => {
                return Err(invalid(
                    &row.id,
                    format!("unknown target kind '{}'", sub_row.target_kind),
                ))
            }
        }
    }

    let (Some(pdf), Some(excel)) = (pdf, excel) else {
        return Err(invalid(&row.id, "request is missing a sub-report"));
    };

    Ok(ReportRequest::from_parts(
        row.id.clone(),
        row.submitter,
        row.description,
        parse_timestamp(&row.created_at, &row.id)?,
        parse_timestamp(&row.updated_at, &row.id)?,
        pdf,
        excel,
    ))
}

fn insert_sub_report(
    conn: &Connection,
    id: &str,
    kind: TargetKind,
    sub: &SubReport,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO sub_reports (request_id, target_kind, status, file_ref, file_size,
         failure_reason, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            kind.as_str(),
            sub.status().as_str(),
            sub.file_ref(),
            size_to_sql(id, sub.file_size())?,
            sub.failure_reason(),
            format_timestamp(sub.created_time()),
            format_timestamp(sub.updated_time()),
        ],
    )?;
    Ok(())
}

fn write(conn: &Connection, request: &ReportRequest) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE report_requests SET submitter = ?2, description = ?3, created_at = ?4,
         updated_at = ?5 WHERE id = ?1",
        params![
            request.id,
            request.submitter,
            request.description,
            format_timestamp(request.created_time),
            format_timestamp(request.updated_time),
        ],
    )?;

    for kind in TargetKind::ALL {
        let sub = request.sub_report(kind);
        conn.execute(
            "UPDATE sub_reports SET status = ?3, file_ref = ?4, file_size = ?5,
             failure_reason = ?6, created_at = ?7, updated_at = ?8
             WHERE request_id = ?1 AND target_kind = ?2",
            params![
                request.id,
                kind.as_str(),
                sub.status().as_str(),
                sub.file_ref(),
                size_to_sql(&request.id, sub.file_size())?,
                sub.failure_reason(),
                format_timestamp(sub.created_time()),
                format_timestamp(sub.updated_time()),
            ],
        )?;
    }
    Ok(())
}

// ─── Repository operations ──────────────────────────────────────────────────

/// Inserts a request with both sub-reports in one transaction.
/// Returns false without writing if the id already exists.
pub fn insert(db: &Database, request: &ReportRequest) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM report_requests WHERE id = ?1)",
            params![request.id],
            |r| r.get(0),
        )?;
        if exists {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO report_requests (id, submitter, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                request.id,
                request.submitter,
                request.description,
                format_timestamp(request.created_time),
                format_timestamp(request.updated_time),
            ],
        )?;
        for kind in TargetKind::ALL {
            insert_sub_report(&tx, &request.id, kind, request.sub_report(kind))?;
        }
        tx.commit()?;
        Ok(true)
    })
}

/// Finds a request by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<ReportRequest>, DatabaseError> {
    db.with_conn(|conn| load(conn, id))
}

/// Lists all requests in insertion order.
pub fn list(db: &Database) -> Result<Vec<ReportRequest>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, submitter, description, created_at, updated_at
             FROM report_requests ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map([], RequestRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(|row| assemble(conn, row)).collect()
    })
}

/// Read-modify-write of one request inside a transaction.
pub fn update_with(
    db: &Database,
    id: &str,
    mutate: &mut dyn FnMut(&mut ReportRequest) -> bool,
) -> Result<Option<ReportRequest>, DatabaseError> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let Some(mut request) = load(&tx, id)? else {
            return Ok(None);
        };
        if mutate(&mut request) {
            write(&tx, &request)?;
            tx.commit()?;
        }
        Ok(Some(request))
    })
}

/// Deletes a request; sub-reports follow via `ON DELETE CASCADE`.
pub fn delete(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let affected = conn.execute("DELETE FROM report_requests WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    })
}

/// Counts sub-reports with the given status across all requests.
pub fn count_by_status(db: &Database, status: ReportStatus) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM sub_reports WHERE status = ?1",
            params![status.as_str()],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

impl RequestStore for Database {
    fn insert(&self, request: &ReportRequest) -> Result<(), StoreError> {
        if !insert(self, request)? {
            return Err(StoreError::DuplicateId(request.id.clone()));
        }
        Ok(())
    }

    fn find_by_id(&self, id: &str) -> Result<Option<ReportRequest>, StoreError> {
        Ok(find_by_id(self, id)?)
    }

    fn list(&self) -> Result<Vec<ReportRequest>, StoreError> {
        Ok(list(self)?)
    }

    fn update(
        &self,
        id: &str,
        mutate: &mut dyn FnMut(&mut ReportRequest) -> bool,
    ) -> Result<Option<ReportRequest>, StoreError> {
        Ok(update_with(self, id, mutate)?)
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(delete(self, id)?)
    }
}
