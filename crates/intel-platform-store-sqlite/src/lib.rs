use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use intel_platform_core::{
    count_query, distinct_query, group_count_query, select_query, DatasetMetadata, GroupCount,
    Incident, IncidentClause, IncidentColumn, IncidentUpdate, NewDataset, NewIncident, NewTicket,
    Projection, SelectQuery, SqlValue, TableColumn, Ticket, TicketClause, TicketColumn, User,
    DATASETS_TABLE, INCIDENTS_TABLE, TICKETS_TABLE, USERS_TABLE,
};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

const CREATE_USERS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  username TEXT NOT NULL UNIQUE,
  password_hash TEXT NOT NULL,
  role TEXT DEFAULT 'user'
);
";

const CREATE_CYBER_INCIDENTS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS cyber_incidents (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  date TEXT NOT NULL,
  incident_type TEXT NOT NULL,
  severity TEXT NOT NULL,
  status TEXT NOT NULL,
  description TEXT,
  reported_by TEXT,
  created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
";

const CREATE_DATASETS_METADATA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS Datasets_Metadata (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  dataset_name TEXT NOT NULL,
  category TEXT,
  source TEXT,
  last_updated DATE,
  record_count INTEGER,
  file_size_mb REAL,
  created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
";

const CREATE_IT_TICKETS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS IT_Tickets (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  ticket_id TEXT UNIQUE NOT NULL,
  priority TEXT NOT NULL,
  status TEXT NOT NULL,
  category TEXT,
  subject TEXT NOT NULL,
  description TEXT,
  created_date DATE,
  resolved_date DATE,
  assigned_to TEXT,
  created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
";

const MANAGED_TABLES: [&str; 4] = [USERS_TABLE, INCIDENTS_TABLE, DATASETS_TABLE, TICKETS_TABLE];

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableStatus {
    pub table: String,
    pub exists: bool,
    pub rows: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreStatus {
    pub tables: Vec<TableStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_rows: usize,
}

impl SqliteStore {
    /// Open the dashboard database, creating its parent directory when needed.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Create every dashboard table that does not exist yet.
    ///
    /// # Errors
    /// Returns an error when any DDL statement fails.
    pub fn create_all_tables(&self) -> Result<()> {
        for (table, ddl) in [
            (USERS_TABLE, CREATE_USERS_SQL),
            (INCIDENTS_TABLE, CREATE_CYBER_INCIDENTS_SQL),
            (DATASETS_TABLE, CREATE_DATASETS_METADATA_SQL),
            (TICKETS_TABLE, CREATE_IT_TICKETS_SQL),
        ] {
            self.conn
                .execute_batch(ddl)
                .with_context(|| format!("failed to create table {table}"))?;
        }
        Ok(())
    }

    /// Report which dashboard tables exist and how many rows each holds.
    ///
    /// # Errors
    /// Returns an error when `sqlite_master` or a row count cannot be read.
    pub fn status(&self) -> Result<StoreStatus> {
        let mut tables = Vec::with_capacity(MANAGED_TABLES.len());
        for table in MANAGED_TABLES {
            let exists = table_exists(&self.conn, table)?;
            let rows = if exists {
                let count: i64 = self
                    .conn
                    .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                    .with_context(|| format!("failed to count rows in {table}"))?;
                Some(count)
            } else {
                None
            };
            tables.push(TableStatus { table: table.to_string(), exists, rows });
        }
        Ok(StoreStatus { tables })
    }

    /// # Errors
    /// Returns an error when the insert violates the table definition.
    pub fn insert_incident(&self, incident: &NewIncident) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO cyber_incidents(id, date, incident_type, severity, status, description, reported_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    incident.id,
                    incident.date,
                    incident.incident_type,
                    incident.severity,
                    incident.status,
                    incident.description,
                    incident.reported_by,
                ],
            )
            .context("failed to insert cyber incident")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Overwrite the date, type, severity and status of one incident.
    ///
    /// Returns `true` when a row matched `id`.
    ///
    /// # Errors
    /// Returns an error when the update statement fails.
    pub fn update_incident(&self, id: i64, update: &IncidentUpdate) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE cyber_incidents SET date = ?1, incident_type = ?2, severity = ?3, status = ?4
                 WHERE id = ?5",
                params![update.date, update.incident_type, update.severity, update.status, id],
            )
            .with_context(|| format!("failed to update cyber incident {id}"))?;
        Ok(changed > 0)
    }

    /// # Errors
    /// Returns an error when the delete statement fails.
    pub fn delete_incident(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM cyber_incidents WHERE id = ?1", params![id])
            .with_context(|| format!("failed to delete cyber incident {id}"))?;
        Ok(changed > 0)
    }

    /// # Errors
    /// Returns an error when the incidents table cannot be read.
    pub fn get_incident(&self, id: i64) -> Result<Option<Incident>> {
        let query = select_query(
            &Projection::Columns(IncidentColumn::ALL.to_vec()),
            &IncidentClause::unconstrained(),
        );
        self.conn
            .query_row(&format!("{} WHERE id = ?1", query.sql), params![id], incident_from_row)
            .optional()
            .with_context(|| format!("failed to load cyber incident {id}"))
    }

    /// # Errors
    /// Returns an error when the incidents table cannot be read.
    pub fn list_incidents(&self, filter: &IncidentClause) -> Result<Vec<Incident>> {
        let query = select_query(&Projection::Columns(IncidentColumn::ALL.to_vec()), filter)
            .order_by(IncidentColumn::Id);
        self.query_rows(&query, incident_from_row).context("failed to list cyber incidents")
    }

    /// Per-value row counts of `column` over the filtered incidents.
    ///
    /// # Errors
    /// Returns an error when the aggregate query fails.
    pub fn incident_group_counts(
        &self,
        column: IncidentColumn,
        filter: &IncidentClause,
    ) -> Result<Vec<GroupCount>> {
        self.query_rows(&group_count_query(column, filter), group_count_from_row)
            .with_context(|| format!("failed to group cyber incidents by {column}"))
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_incidents(&self, filter: &IncidentClause) -> Result<i64> {
        self.count(&count_query(filter)).context("failed to count cyber incidents")
    }

    /// # Errors
    /// Returns an error when the distinct query fails.
    pub fn incident_distinct_values(&self, column: IncidentColumn) -> Result<Vec<String>> {
        self.query_rows(&distinct_query(column), |row| lenient_text(row, 0))
            .map(|values| values.into_iter().flatten().collect())
            .with_context(|| format!("failed to list distinct cyber incident {column} values"))
    }

    /// Drop the incidents table. Later incident reads fail until the schema is recreated.
    ///
    /// # Errors
    /// Returns an error when the table does not exist.
    pub fn drop_incidents_table(&self) -> Result<()> {
        self.conn
            .execute_batch("DROP TABLE cyber_incidents")
            .context("failed to drop cyber_incidents")
    }

    /// Bulk-load incidents from a CSV file with one header row.
    ///
    /// Only the first five columns (`id, date, incident_type, severity, status`) are
    /// read. An empty `id` lets SQLite assign one. Rows are inserted as-is in a
    /// single transaction.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, a row has fewer than five
    /// fields, or an insert fails. No rows are kept in that case.
    pub fn import_incidents_csv(&mut self, path: &Path) -> Result<ImportSummary> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("failed to open incidents csv {}", path.display()))?;

        let tx = self.conn.transaction().context("failed to begin csv import")?;
        let mut imported_rows = 0_usize;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO cyber_incidents(id, date, incident_type, severity, status)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (index, record) in reader.records().enumerate() {
                let line = index + 2;
                let record =
                    record.with_context(|| format!("failed to read csv row at line {line}"))?;
                if record.len() < 5 {
                    return Err(anyhow!(
                        "csv row at line {line} has {} fields; expected at least 5",
                        record.len()
                    ));
                }
                let id = Some(&record[0]).filter(|value| !value.trim().is_empty());
                stmt.execute(params![id, &record[1], &record[2], &record[3], &record[4]])
                    .with_context(|| format!("failed to import csv row at line {line}"))?;
                imported_rows += 1;
            }
        }
        tx.commit().context("failed to commit csv import")?;

        tracing::info!(path = %path.display(), imported_rows, "imported cyber incidents csv");
        Ok(ImportSummary { imported_rows })
    }

    /// # Errors
    /// Returns an error when the insert fails, including a duplicate `ticket_id`.
    pub fn insert_ticket(&self, ticket: &NewTicket) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO IT_Tickets(
                   ticket_id, priority, status, category, subject, description,
                   created_date, resolved_date, assigned_to
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    ticket.ticket_id,
                    ticket.priority,
                    ticket.status,
                    ticket.category,
                    ticket.subject,
                    ticket.description,
                    ticket.created_date,
                    ticket.resolved_date,
                    ticket.assigned_to,
                ],
            )
            .with_context(|| format!("failed to insert ticket {}", ticket.ticket_id))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Replace every editable field of the ticket with the same `ticket_id`.
    ///
    /// # Errors
    /// Returns an error when the update statement fails.
    pub fn update_ticket(&self, ticket: &NewTicket) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE IT_Tickets SET
                   priority = ?1, status = ?2, category = ?3, subject = ?4, description = ?5,
                   created_date = ?6, resolved_date = ?7, assigned_to = ?8
                 WHERE ticket_id = ?9",
                params![
                    ticket.priority,
                    ticket.status,
                    ticket.category,
                    ticket.subject,
                    ticket.description,
                    ticket.created_date,
                    ticket.resolved_date,
                    ticket.assigned_to,
                    ticket.ticket_id,
                ],
            )
            .with_context(|| format!("failed to update ticket {}", ticket.ticket_id))?;
        Ok(changed > 0)
    }

    /// # Errors
    /// Returns an error when the delete statement fails.
    pub fn delete_ticket(&self, ticket_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM IT_Tickets WHERE ticket_id = ?1", params![ticket_id])
            .with_context(|| format!("failed to delete ticket {ticket_id}"))?;
        Ok(changed > 0)
    }

    /// # Errors
    /// Returns an error when the tickets table cannot be read.
    pub fn get_ticket(&self, ticket_id: &str) -> Result<Option<Ticket>> {
        let query = select_query(
            &Projection::Columns(TicketColumn::ALL.to_vec()),
            &TicketClause::unconstrained(),
        );
        self.conn
            .query_row(
                &format!("{} WHERE ticket_id = ?1", query.sql),
                params![ticket_id],
                ticket_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load ticket {ticket_id}"))
    }

    /// # Errors
    /// Returns an error when the tickets table cannot be read.
    pub fn list_tickets(&self, filter: &TicketClause) -> Result<Vec<Ticket>> {
        let query = select_query(&Projection::Columns(TicketColumn::ALL.to_vec()), filter)
            .order_by(TicketColumn::Id);
        self.query_rows(&query, ticket_from_row).context("failed to list tickets")
    }

    /// # Errors
    /// Returns an error when the aggregate query fails.
    pub fn ticket_group_counts(
        &self,
        column: TicketColumn,
        filter: &TicketClause,
    ) -> Result<Vec<GroupCount>> {
        self.query_rows(&group_count_query(column, filter), group_count_from_row)
            .with_context(|| format!("failed to group tickets by {column}"))
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_tickets(&self, filter: &TicketClause) -> Result<i64> {
        self.count(&count_query(filter)).context("failed to count tickets")
    }

    /// # Errors
    /// Returns an error when the distinct query fails.
    pub fn ticket_distinct_values(&self, column: TicketColumn) -> Result<Vec<String>> {
        self.query_rows(&distinct_query(column), |row| lenient_text(row, 0))
            .map(|values| values.into_iter().flatten().collect())
            .with_context(|| format!("failed to list distinct ticket {column} values"))
    }

    /// Tickets per `created_date`, oldest first. Undated tickets are left off the timeline.
    ///
    /// # Errors
    /// Returns an error when the aggregate query fails.
    pub fn ticket_date_counts(&self, filter: &TicketClause) -> Result<Vec<GroupCount>> {
        let points = self.ticket_group_counts(TicketColumn::CreatedDate, filter)?;
        Ok(points.into_iter().filter(|point| point.value.is_some()).collect())
    }

    /// # Errors
    /// Returns an error when the username is taken or the insert fails.
    pub fn insert_user(&self, username: &str, password_hash: &str, role: &str) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO users(username, password_hash, role) VALUES (?1, ?2, ?3)",
                params![username, password_hash, role],
            )
            .with_context(|| format!("failed to insert user {username}"))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// # Errors
    /// Returns an error when the users table cannot be read.
    pub fn find_user(&self, username: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, username, password_hash, COALESCE(role, 'user') FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        password_hash: row.get(2)?,
                        role: row.get(3)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load user {username}"))
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_dataset(&self, dataset: &NewDataset) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO Datasets_Metadata(
                   dataset_name, category, source, last_updated, record_count, file_size_mb
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    dataset.dataset_name,
                    dataset.category,
                    dataset.source,
                    dataset.last_updated,
                    dataset.record_count,
                    dataset.file_size_mb,
                ],
            )
            .with_context(|| format!("failed to insert dataset {}", dataset.dataset_name))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// # Errors
    /// Returns an error when the metadata table cannot be read.
    pub fn list_datasets(&self) -> Result<Vec<DatasetMetadata>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, dataset_name, category, source, last_updated, record_count, file_size_mb, created_at
             FROM Datasets_Metadata ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DatasetMetadata {
                id: row.get(0)?,
                dataset_name: row.get(1)?,
                category: lenient_text(row, 2)?,
                source: lenient_text(row, 3)?,
                last_updated: lenient_text(row, 4)?,
                record_count: row.get(5)?,
                file_size_mb: row.get(6)?,
                created_at: lenient_text(row, 7)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to list dataset metadata")
    }

    fn query_rows<T, F>(&self, query: &SelectQuery, map: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self
            .conn
            .prepare(&query.sql)
            .with_context(|| format!("failed to prepare query: {}", query.sql))?;
        let rows = stmt.query_map(params_from_iter(query.params.iter().map(bound_value)), map)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn count(&self, query: &SelectQuery) -> Result<i64> {
        let count = self.conn.query_row(
            &query.sql,
            params_from_iter(query.params.iter().map(bound_value)),
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

/// Whether `err` was caused by a UNIQUE, NOT NULL or primary key violation.
#[must_use]
pub fn is_constraint_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == rusqlite::ErrorCode::ConstraintViolation
        )
    })
}

fn bound_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Integer(value) => Value::Integer(*value),
        SqlValue::Text(value) => Value::Text(value.clone()),
    }
}

/// Read a column as text whatever affinity SQLite stored it with.
fn lenient_text(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<String>> {
    Ok(match row.get_ref(index)? {
        ValueRef::Null => None,
        ValueRef::Integer(value) => Some(value.to_string()),
        ValueRef::Real(value) => Some(value.to_string()),
        ValueRef::Text(value) | ValueRef::Blob(value) => {
            Some(String::from_utf8_lossy(value).into_owned())
        }
    })
}

fn required_text(row: &Row<'_>, index: usize) -> rusqlite::Result<String> {
    Ok(lenient_text(row, index)?.unwrap_or_default())
}

fn incident_from_row(row: &Row<'_>) -> rusqlite::Result<Incident> {
    Ok(Incident {
        id: row.get(0)?,
        date: required_text(row, 1)?,
        incident_type: required_text(row, 2)?,
        severity: required_text(row, 3)?,
        status: required_text(row, 4)?,
        description: lenient_text(row, 5)?,
        reported_by: lenient_text(row, 6)?,
        created_at: lenient_text(row, 7)?,
    })
}

fn ticket_from_row(row: &Row<'_>) -> rusqlite::Result<Ticket> {
    Ok(Ticket {
        id: row.get(0)?,
        ticket_id: required_text(row, 1)?,
        priority: required_text(row, 2)?,
        status: required_text(row, 3)?,
        category: lenient_text(row, 4)?,
        subject: required_text(row, 5)?,
        description: lenient_text(row, 6)?,
        created_date: lenient_text(row, 7)?,
        resolved_date: lenient_text(row, 8)?,
        assigned_to: lenient_text(row, 9)?,
        created_at: lenient_text(row, 10)?,
    })
}

fn group_count_from_row(row: &Row<'_>) -> rusqlite::Result<GroupCount> {
    Ok(GroupCount { value: lenient_text(row, 0)?, count: row.get(1)? })
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}
