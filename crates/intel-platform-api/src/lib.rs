use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use intel_platform_core::{
    chart_series, ChartSeries, ChatMessage, DashboardError, DatasetMetadata, GroupCount, Incident,
    IncidentColumn, IncidentFilter, IncidentUpdate, NewDataset, NewIncident, NewTicket,
    SessionContext, Ticket, TicketClause, TicketColumn, TicketFilter, DEFAULT_USER_ROLE,
    SEVERITY_OPTIONS, TICKET_PRIORITY_OPTIONS, TICKET_STATUS_OPTIONS, TICKET_SUBJECT_OPTIONS,
};
use intel_platform_store_sqlite::{is_constraint_violation, ImportSummary, SqliteStore, StoreStatus};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";
pub const DEFAULT_DB_PATH: &str = "DATA/intelligence_platform.db";
pub const DEFAULT_INCIDENTS_CSV: &str = "DATA/cyber_incidents.csv";

const INCIDENTS_CHART_SUBJECT: &str = "Cyber Incidents";
const TICKETS_CHART_SUBJECT: &str = "IT Tickets";
const REQUIRED_FIELDS_MESSAGE: &str = "Please fill in all required fields.";

/// Success or error banner produced by a form submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationOutcome {
    pub success: bool,
    pub message: String,
}

impl MutationOutcome {
    fn succeeded(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into() }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TicketAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum IncidentAction {
    Create { incident: NewIncident },
    Update { id: i64, update: IncidentUpdate },
    Delete { id: i64 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CyberAnalyticsRequest {
    #[serde(flatten)]
    pub filter: IncidentFilter,
    pub chart_column: Option<IncidentColumn>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ItTicketsRequest {
    #[serde(flatten)]
    pub filter: TicketFilter,
    pub chart_column: Option<TicketColumn>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncidentFormOptions {
    pub incident_types: Vec<String>,
    pub severities: Vec<String>,
    pub statuses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TicketFormOptions {
    pub categories: Vec<String>,
    pub priorities: Vec<String>,
    pub statuses: Vec<String>,
    pub subjects: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CyberAnalyticsPage {
    pub username: String,
    pub row_count: i64,
    pub chart: ChartSeries,
    pub incidents: Vec<Incident>,
    pub options: IncidentFormOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItTicketsPage {
    pub username: String,
    pub tickets: Vec<Ticket>,
    pub row_count: i64,
    pub chart: ChartSeries,
    pub timeline: ChartSeries,
    pub options: TicketFormOptions,
    pub transcript: Vec<ChatMessage>,
}

#[derive(Debug, Clone)]
pub struct DashboardApi {
    db_path: PathBuf,
}

impl DashboardApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Create any missing dashboard tables and report the resulting status.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or a DDL statement fails.
    pub fn init_schema(&self) -> Result<StoreStatus> {
        let store = self.open_store()?;
        store.create_all_tables()?;
        store.status()
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or inspected.
    pub fn status(&self) -> Result<StoreStatus> {
        self.open_store()?.status()
    }

    /// # Errors
    /// Returns an error when the CSV cannot be read or any row fails to insert.
    pub fn import_incidents_csv(&self, csv_path: &Path) -> Result<ImportSummary> {
        let mut store = self.open_store()?;
        store.import_incidents_csv(csv_path)
    }

    /// # Errors
    /// Returns an error when persistence fails.
    pub fn add_incident(&self, incident: &NewIncident) -> Result<i64> {
        self.open_store()?.insert_incident(incident)
    }

    /// # Errors
    /// Returns an error when persistence fails.
    pub fn update_incident(&self, id: i64, update: &IncidentUpdate) -> Result<bool> {
        self.open_store()?.update_incident(id, update)
    }

    /// # Errors
    /// Returns an error when persistence fails.
    pub fn delete_incident(&self, id: i64) -> Result<bool> {
        self.open_store()?.delete_incident(id)
    }

    /// # Errors
    /// Returns an error when the incidents table cannot be read.
    pub fn incident(&self, id: i64) -> Result<Option<Incident>> {
        self.open_store()?.get_incident(id)
    }

    /// # Errors
    /// Returns an error when the incidents table cannot be read.
    pub fn list_incidents(&self, filter: &IncidentFilter) -> Result<Vec<Incident>> {
        self.open_store()?.list_incidents(&filter.where_clause())
    }

    /// # Errors
    /// Returns an error when the aggregate query fails.
    pub fn incident_groups(
        &self,
        column: IncidentColumn,
        filter: &IncidentFilter,
    ) -> Result<Vec<GroupCount>> {
        self.open_store()?.incident_group_counts(column, &filter.where_clause())
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_incidents(&self, filter: &IncidentFilter) -> Result<i64> {
        self.open_store()?.count_incidents(&filter.where_clause())
    }

    /// # Errors
    /// Returns an error when the table does not exist.
    pub fn drop_incidents_table(&self) -> Result<()> {
        self.open_store()?.drop_incidents_table()?;
        tracing::warn!(db = %self.db_path.display(), "dropped cyber_incidents table");
        Ok(())
    }

    /// # Errors
    /// Returns an error when persistence fails, including a duplicate `ticket_id`.
    pub fn add_ticket(&self, ticket: &NewTicket) -> Result<i64> {
        self.open_store()?.insert_ticket(ticket)
    }

    /// # Errors
    /// Returns an error when persistence fails.
    pub fn update_ticket(&self, ticket: &NewTicket) -> Result<bool> {
        self.open_store()?.update_ticket(ticket)
    }

    /// # Errors
    /// Returns an error when persistence fails.
    pub fn delete_ticket(&self, ticket_id: &str) -> Result<bool> {
        self.open_store()?.delete_ticket(ticket_id)
    }

    /// # Errors
    /// Returns an error when the tickets table cannot be read.
    pub fn ticket(&self, ticket_id: &str) -> Result<Option<Ticket>> {
        self.open_store()?.get_ticket(ticket_id)
    }

    /// # Errors
    /// Returns an error when the tickets table cannot be read.
    pub fn list_tickets(&self, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        self.open_store()?.list_tickets(&filter.where_clause())
    }

    /// # Errors
    /// Returns an error when the aggregate query fails.
    pub fn ticket_groups(&self, column: TicketColumn, filter: &TicketFilter) -> Result<Vec<GroupCount>> {
        self.open_store()?.ticket_group_counts(column, &filter.where_clause())
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_tickets(&self, filter: &TicketFilter) -> Result<i64> {
        self.open_store()?.count_tickets(&filter.where_clause())
    }

    /// # Errors
    /// Returns an error when the aggregate query fails.
    pub fn ticket_dates(&self, filter: &TicketFilter) -> Result<Vec<GroupCount>> {
        self.open_store()?.ticket_date_counts(&filter.where_clause())
    }

    /// # Errors
    /// Returns an error when persistence fails.
    pub fn add_dataset(&self, dataset: &NewDataset) -> Result<i64> {
        self.open_store()?.insert_dataset(dataset)
    }

    /// # Errors
    /// Returns an error when the metadata table cannot be read.
    pub fn list_datasets(&self) -> Result<Vec<DatasetMetadata>> {
        self.open_store()?.list_datasets()
    }

    /// Create a user with an Argon2 password hash.
    ///
    /// # Errors
    /// Returns [`DashboardError::Validation`] for a blank username or password, and
    /// a store error when the username is taken.
    pub fn register_user(&self, username: &str, password: &str, role: Option<&str>) -> Result<i64> {
        let username = username.trim();
        if username.is_empty() {
            return Err(DashboardError::Validation("username MUST be provided".to_string()).into());
        }
        if password.is_empty() {
            return Err(DashboardError::Validation("password MUST be provided".to_string()).into());
        }

        let password_hash = hash_password(password)?;
        let id = self.open_store()?.insert_user(
            username,
            &password_hash,
            role.unwrap_or(DEFAULT_USER_ROLE),
        )?;
        tracing::info!(username, "registered dashboard user");
        Ok(id)
    }

    /// Verify credentials and mark `session` as logged in.
    ///
    /// # Errors
    /// Returns [`DashboardError::InvalidCredentials`] for an unknown user or a wrong
    /// password, or a store error when the users table cannot be read.
    pub fn login(&self, session: &mut SessionContext, username: &str, password: &str) -> Result<()> {
        let user = self.open_store()?.find_user(username.trim())?;
        match user {
            Some(user) if verify_password(password, &user.password_hash) => {
                session.logout();
                session.sign_in(user.username, user.role);
                tracing::info!(username, "login succeeded");
                Ok(())
            }
            _ => {
                tracing::warn!(username, "login rejected");
                Err(DashboardError::InvalidCredentials.into())
            }
        }
    }

    /// Assemble the cyber analytics page for the current filter.
    ///
    /// # Errors
    /// Returns [`DashboardError::NotLoggedIn`] without touching the database when the
    /// session is anonymous, or a store error when a query fails.
    pub fn cyber_analytics_page(
        &self,
        session: &SessionContext,
        request: &CyberAnalyticsRequest,
    ) -> Result<CyberAnalyticsPage> {
        let username = session.require_login()?.to_string();
        let store = self.open_store()?;
        let clause = request.filter.where_clause();
        let chart_column = request.chart_column.unwrap_or(IncidentColumn::IncidentType);

        let incidents = store.list_incidents(&clause)?;
        let row_count = store.count_incidents(&clause)?;
        let points = store.incident_group_counts(chart_column, &clause)?;
        let options = IncidentFormOptions {
            incident_types: store.incident_distinct_values(IncidentColumn::IncidentType)?,
            severities: SEVERITY_OPTIONS.iter().map(ToString::to_string).collect(),
            statuses: store.incident_distinct_values(IncidentColumn::Status)?,
        };

        Ok(CyberAnalyticsPage {
            username,
            row_count,
            chart: chart_series(INCIDENTS_CHART_SUBJECT, chart_column, points),
            incidents,
            options,
        })
    }

    /// Assemble the IT tickets page: the full table plus filtered aggregates.
    ///
    /// # Errors
    /// Returns [`DashboardError::NotLoggedIn`] for an anonymous session, or a store
    /// error when a query fails.
    pub fn it_tickets_page(
        &self,
        session: &SessionContext,
        request: &ItTicketsRequest,
    ) -> Result<ItTicketsPage> {
        let username = session.require_login()?.to_string();
        let store = self.open_store()?;
        let clause = request.filter.where_clause();
        let chart_column = request.chart_column.unwrap_or(TicketColumn::Category);

        let tickets = store.list_tickets(&TicketClause::unconstrained())?;
        let row_count = store.count_tickets(&clause)?;
        let points = store.ticket_group_counts(chart_column, &clause)?;
        let dates = store.ticket_date_counts(&clause)?;
        let options = TicketFormOptions {
            categories: store.ticket_distinct_values(TicketColumn::Category)?,
            priorities: TICKET_PRIORITY_OPTIONS.iter().map(ToString::to_string).collect(),
            statuses: TICKET_STATUS_OPTIONS.iter().map(ToString::to_string).collect(),
            subjects: TICKET_SUBJECT_OPTIONS.iter().map(ToString::to_string).collect(),
        };

        Ok(ItTicketsPage {
            username,
            tickets,
            row_count,
            chart: chart_series(TICKETS_CHART_SUBJECT, chart_column, points),
            timeline: chart_series(TICKETS_CHART_SUBJECT, TicketColumn::CreatedDate, dates),
            options,
            transcript: session.visible_transcript(),
        })
    }

    /// Apply a submitted incident form.
    ///
    /// # Errors
    /// Returns [`DashboardError::NotLoggedIn`] for an anonymous session, or a store
    /// error other than a constraint violation.
    pub fn incident_action(
        &self,
        session: &SessionContext,
        action: &IncidentAction,
    ) -> Result<MutationOutcome> {
        session.require_login()?;
        let outcome = match action {
            IncidentAction::Create { incident } => {
                if let Err(err) = incident.validate() {
                    tracing::debug!(error = %err, "incident form rejected");
                    return Ok(MutationOutcome::failed(REQUIRED_FIELDS_MESSAGE));
                }
                match self.add_incident(incident) {
                    Ok(id) => MutationOutcome::succeeded(format!("Incident {id} created successfully.")),
                    Err(err) if is_constraint_violation(&err) => {
                        MutationOutcome::failed(format!("Failed to create incident: {err:#}"))
                    }
                    Err(err) => return Err(err),
                }
            }
            IncidentAction::Update { id, update } => {
                if self.update_incident(*id, update)? {
                    MutationOutcome::succeeded(format!("Incident {id} updated successfully."))
                } else {
                    MutationOutcome::failed(format!("Failed to update incident {id}."))
                }
            }
            IncidentAction::Delete { id } => {
                if self.delete_incident(*id)? {
                    MutationOutcome::succeeded(format!("Incident {id} deleted successfully."))
                } else {
                    MutationOutcome::failed(format!("Failed to delete incident {id}."))
                }
            }
        };
        tracing::info!(success = outcome.success, message = %outcome.message, "incident form applied");
        Ok(outcome)
    }

    /// Apply the ticket form with the chosen action. Update and delete match on `ticket_id`.
    ///
    /// # Errors
    /// Returns [`DashboardError::NotLoggedIn`] for an anonymous session, or a store
    /// error other than a constraint violation.
    pub fn ticket_action(
        &self,
        session: &SessionContext,
        action: TicketAction,
        ticket: &NewTicket,
    ) -> Result<MutationOutcome> {
        session.require_login()?;
        let ticket_id = &ticket.ticket_id;
        let valid = match action {
            TicketAction::Delete => !ticket_id.trim().is_empty(),
            TicketAction::Create | TicketAction::Update => ticket.validate().is_ok(),
        };
        if !valid {
            return Ok(MutationOutcome::failed(REQUIRED_FIELDS_MESSAGE));
        }

        let outcome = match action {
            TicketAction::Create => match self.add_ticket(ticket) {
                Ok(_) => MutationOutcome::succeeded(format!("Ticket '{ticket_id}' created successfully.")),
                Err(err) if is_constraint_violation(&err) => {
                    MutationOutcome::failed(format!("Failed to create ticket '{ticket_id}'."))
                }
                Err(err) => return Err(err),
            },
            TicketAction::Update => {
                if self.update_ticket(ticket)? {
                    MutationOutcome::succeeded(format!("Ticket '{ticket_id}' updated successfully."))
                } else {
                    MutationOutcome::failed(format!("Failed to update ticket '{ticket_id}'."))
                }
            }
            TicketAction::Delete => {
                if self.delete_ticket(ticket_id)? {
                    MutationOutcome::succeeded(format!("Ticket '{ticket_id}' deleted successfully."))
                } else {
                    MutationOutcome::failed(format!("Failed to delete ticket '{ticket_id}'."))
                }
            }
        };
        tracing::info!(?action, success = outcome.success, ticket_id = %ticket_id, "ticket form applied");
        Ok(outcome)
    }
}

/// Clear the session flags and transcript.
pub fn logout(session: &mut SessionContext) {
    if let Some(username) = session.username.as_deref() {
        tracing::info!(username, "logged out");
    }
    session.logout();
}

/// Record the user's prompt and return the conversation to send to the assistant.
///
/// # Errors
/// Returns [`DashboardError::NotLoggedIn`] for an anonymous session and
/// [`DashboardError::Validation`] for a blank prompt.
pub fn begin_chat_turn(
    session: &mut SessionContext,
    prompt: &str,
) -> Result<Vec<ChatMessage>, DashboardError> {
    session.require_login()?;
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(DashboardError::Validation("prompt MUST be provided".to_string()));
    }
    session.push_message(ChatMessage::user(prompt));
    Ok(session.conversation.clone())
}

/// Store the assistant's completed reply.
pub fn finish_chat_turn(session: &mut SessionContext, reply: impl Into<String>) {
    session.push_message(ChatMessage::assistant(reply));
}

/// Whether `err` carries a [`DashboardError`] anywhere in its chain.
#[must_use]
pub fn dashboard_error(err: &anyhow::Error) -> Option<&DashboardError> {
    err.chain().find_map(|cause| cause.downcast_ref::<DashboardError>())
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| anyhow!("failed to hash password: {err}"))
}

fn verify_password(password: &str, stored_hash: &str) -> bool {
    PasswordHash::new(stored_hash).is_ok_and(|parsed| {
        Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
    })
}
