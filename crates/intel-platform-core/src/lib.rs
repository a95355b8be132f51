use std::fmt::{Debug, Display, Formatter};
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use time::Date;

pub const INCIDENTS_TABLE: &str = "cyber_incidents";
pub const TICKETS_TABLE: &str = "IT_Tickets";
pub const USERS_TABLE: &str = "users";
pub const DATASETS_TABLE: &str = "Datasets_Metadata";

pub const LOGIN_PAGE: &str = "/login";
pub const DEFAULT_USER_ROLE: &str = "user";

pub const SEVERITY_OPTIONS: [&str; 4] = ["Low", "Medium", "High", "Critical"];
pub const TICKET_PRIORITY_OPTIONS: [&str; 4] = ["low", "medium", "high", "urgent"];
pub const TICKET_STATUS_OPTIONS: [&str; 3] = ["open", "in progress", "resolved"];
pub const TICKET_SUBJECT_OPTIONS: [&str; 10] = [
    "Printer not working",
    "Password reset request",
    "VPN connection issue",
    "Network outage",
    "Access request",
    "Software installation needed",
    "Malware alert",
    "Laptop not booting",
    "System Crash",
    "Email not syncing",
];

pub const IT_EXPERT_SYSTEM_PROMPT: &str = "You are an IT expert, you hold knowledge specialising in office related IT incidents. Make sure your responses are not too long";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DashboardError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unknown column `{column}` for table {table}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("not logged in; continue at {redirect}")]
    NotLoggedIn { redirect: &'static str },
    #[error("invalid username or password")]
    InvalidCredentials,
}

/// A column that may appear in generated SQL for one table.
///
/// Implementors are closed enums, so every identifier that reaches a query
/// string comes from this allow-list rather than from caller input.
pub trait TableColumn: Copy + Eq + Debug + 'static {
    const TABLE: &'static str;
    const ALL: &'static [Self];

    fn as_str(self) -> &'static str;

    /// Human-readable name used in chart titles.
    fn label(self) -> &'static str;

    #[must_use]
    fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|column| column.as_str() == value)
    }

    /// Parse a column name, reporting the table it was checked against.
    ///
    /// # Errors
    /// Returns [`DashboardError::UnknownColumn`] when the name is not allow-listed.
    fn parse_checked(value: &str) -> Result<Self, DashboardError> {
        Self::parse(value).ok_or_else(|| DashboardError::UnknownColumn {
            table: Self::TABLE,
            column: value.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum IncidentColumn {
    Id,
    Date,
    IncidentType,
    Severity,
    Status,
    Description,
    ReportedBy,
    CreatedAt,
}

impl TableColumn for IncidentColumn {
    const TABLE: &'static str = INCIDENTS_TABLE;
    const ALL: &'static [Self] = &[
        Self::Id,
        Self::Date,
        Self::IncidentType,
        Self::Severity,
        Self::Status,
        Self::Description,
        Self::ReportedBy,
        Self::CreatedAt,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Date => "date",
            Self::IncidentType => "incident_type",
            Self::Severity => "severity",
            Self::Status => "status",
            Self::Description => "description",
            Self::ReportedBy => "reported_by",
            Self::CreatedAt => "created_at",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Id => "Id",
            Self::Date => "Date",
            Self::IncidentType => "Incident Type",
            Self::Severity => "Severity",
            Self::Status => "Status",
            Self::Description => "Description",
            Self::ReportedBy => "Reported By",
            Self::CreatedAt => "Created At",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum TicketColumn {
    Id,
    TicketId,
    Priority,
    Status,
    Category,
    Subject,
    Description,
    CreatedDate,
    ResolvedDate,
    AssignedTo,
    CreatedAt,
}

impl TableColumn for TicketColumn {
    const TABLE: &'static str = TICKETS_TABLE;
    const ALL: &'static [Self] = &[
        Self::Id,
        Self::TicketId,
        Self::Priority,
        Self::Status,
        Self::Category,
        Self::Subject,
        Self::Description,
        Self::CreatedDate,
        Self::ResolvedDate,
        Self::AssignedTo,
        Self::CreatedAt,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::TicketId => "ticket_id",
            Self::Priority => "priority",
            Self::Status => "status",
            Self::Category => "category",
            Self::Subject => "subject",
            Self::Description => "description",
            Self::CreatedDate => "created_date",
            Self::ResolvedDate => "resolved_date",
            Self::AssignedTo => "assigned_to",
            Self::CreatedAt => "created_at",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Id => "Id",
            Self::TicketId => "Ticket Id",
            Self::Priority => "Priority",
            Self::Status => "Status",
            Self::Category => "Category",
            Self::Subject => "Subject",
            Self::Description => "Description",
            Self::CreatedDate => "Created Date",
            Self::ResolvedDate => "Resolved Date",
            Self::AssignedTo => "Assigned To",
            Self::CreatedAt => "Created At",
        }
    }
}

impl TryFrom<String> for IncidentColumn {
    type Error = DashboardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse_checked(&value)
    }
}

impl TryFrom<String> for TicketColumn {
    type Error = DashboardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse_checked(&value)
    }
}

impl Display for IncidentColumn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Display for TicketColumn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value bound to a `?` placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Integer(i64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<&String> for SqlValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<Date> for SqlValue {
    fn from(value: Date) -> Self {
        Self::Text(iso_date(value))
    }
}

/// Format a date the way the dashboard stores it (`YYYY-MM-DD`).
#[must_use]
pub fn iso_date(value: Date) -> String {
    format!("{:04}-{:02}-{:02}", value.year(), u8::from(value.month()), value.day())
}

/// A flat conjunction of parameterized predicates over one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhereClause<C> {
    fragments: Vec<String>,
    params: Vec<SqlValue>,
    table: PhantomData<C>,
}

pub type IncidentClause = WhereClause<IncidentColumn>;
pub type TicketClause = WhereClause<TicketColumn>;

impl<C: TableColumn> WhereClause<C> {
    #[must_use]
    pub fn unconstrained() -> Self {
        Self { fragments: Vec::new(), params: Vec::new(), table: PhantomData }
    }

    #[must_use]
    pub fn is_unconstrained(&self) -> bool {
        self.fragments.is_empty()
    }

    /// SQL text of the predicate; `1=1` when nothing was filtered.
    #[must_use]
    pub fn sql(&self) -> String {
        if self.fragments.is_empty() {
            "1=1".to_string()
        } else {
            self.fragments.join(" AND ")
        }
    }

    #[must_use]
    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }
}

impl<C: TableColumn> Default for WhereClause<C> {
    fn default() -> Self {
        Self::unconstrained()
    }
}

#[derive(Debug, Clone)]
pub struct FilterBuilder<C> {
    clause: WhereClause<C>,
}

impl<C: TableColumn> FilterBuilder<C> {
    #[must_use]
    pub fn new() -> Self {
        Self { clause: WhereClause::unconstrained() }
    }

    #[must_use]
    pub fn at_least(self, column: C, value: impl Into<SqlValue>) -> Self {
        self.push(format!("{} >= ?", column.as_str()), vec![value.into()])
    }

    #[must_use]
    pub fn at_most(self, column: C, value: impl Into<SqlValue>) -> Self {
        self.push(format!("{} <= ?", column.as_str()), vec![value.into()])
    }

    #[must_use]
    pub fn equals(self, column: C, value: impl Into<SqlValue>) -> Self {
        self.push(format!("{} = ?", column.as_str()), vec![value.into()])
    }

    /// Restrict `column` to the given values. An empty selection adds nothing.
    #[must_use]
    pub fn one_of<I, V>(self, column: C, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        let params = values.into_iter().map(Into::into).collect::<Vec<_>>();
        if params.is_empty() {
            return self;
        }
        let placeholders = vec!["?"; params.len()].join(", ");
        self.push(format!("{} IN ({placeholders})", column.as_str()), params)
    }

    #[must_use]
    pub fn at_least_opt<V: Into<SqlValue>>(self, column: C, value: Option<V>) -> Self {
        match value {
            Some(value) => self.at_least(column, value),
            None => self,
        }
    }

    #[must_use]
    pub fn at_most_opt<V: Into<SqlValue>>(self, column: C, value: Option<V>) -> Self {
        match value {
            Some(value) => self.at_most(column, value),
            None => self,
        }
    }

    #[must_use]
    pub fn build(self) -> WhereClause<C> {
        self.clause
    }

    fn push(mut self, fragment: String, params: Vec<SqlValue>) -> Self {
        self.clause.fragments.push(fragment);
        self.clause.params.extend(params);
        self
    }
}

impl<C: TableColumn> Default for FilterBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentFilter {
    pub date_from: Option<Date>,
    pub date_to: Option<Date>,
    pub incident_types: Vec<String>,
    pub severities: Vec<String>,
    pub statuses: Vec<String>,
}

impl IncidentFilter {
    #[must_use]
    pub fn where_clause(&self) -> IncidentClause {
        FilterBuilder::new()
            .at_least_opt(IncidentColumn::Date, self.date_from)
            .at_most_opt(IncidentColumn::Date, self.date_to)
            .one_of(IncidentColumn::IncidentType, &self.incident_types)
            .one_of(IncidentColumn::Severity, &self.severities)
            .one_of(IncidentColumn::Status, &self.statuses)
            .build()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketFilter {
    pub created_from: Option<Date>,
    pub created_to: Option<Date>,
    pub statuses: Vec<String>,
    pub priorities: Vec<String>,
    pub subjects: Vec<String>,
    pub id_start: Option<i64>,
    pub id_end: Option<i64>,
}

impl TicketFilter {
    #[must_use]
    pub fn where_clause(&self) -> TicketClause {
        FilterBuilder::new()
            .at_least_opt(TicketColumn::CreatedDate, self.created_from)
            .at_most_opt(TicketColumn::CreatedDate, self.created_to)
            .one_of(TicketColumn::Status, &self.statuses)
            .one_of(TicketColumn::Priority, &self.priorities)
            .one_of(TicketColumn::Subject, &self.subjects)
            .at_least_opt(TicketColumn::Id, self.id_start)
            .at_most_opt(TicketColumn::Id, self.id_end)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection<C> {
    All,
    Columns(Vec<C>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl SelectQuery {
    #[must_use]
    pub fn order_by<C: TableColumn>(mut self, column: C) -> Self {
        self.sql.push_str(" ORDER BY ");
        self.sql.push_str(column.as_str());
        self
    }
}

/// Build `SELECT <cols> FROM <table>`, appending a single `WHERE` only when the
/// clause actually constrains something.
#[must_use]
pub fn select_query<C: TableColumn>(
    projection: &Projection<C>,
    filter: &WhereClause<C>,
) -> SelectQuery {
    let columns = match projection {
        Projection::All => "*".to_string(),
        Projection::Columns(columns) if columns.is_empty() => "*".to_string(),
        Projection::Columns(columns) => {
            columns.iter().map(|column| column.as_str()).collect::<Vec<_>>().join(", ")
        }
    };
    with_filter(format!("SELECT {columns} FROM {}", C::TABLE), filter)
}

#[must_use]
pub fn count_query<C: TableColumn>(filter: &WhereClause<C>) -> SelectQuery {
    with_filter(format!("SELECT COUNT(*) FROM {}", C::TABLE), filter)
}

#[must_use]
pub fn group_count_query<C: TableColumn>(column: C, filter: &WhereClause<C>) -> SelectQuery {
    let name = column.as_str();
    let mut query = with_filter(format!("SELECT {name}, COUNT(*) FROM {}", C::TABLE), filter);
    query.sql.push_str(&format!(" GROUP BY {name} ORDER BY {name}"));
    query
}

#[must_use]
pub fn distinct_query<C: TableColumn>(column: C) -> SelectQuery {
    let name = column.as_str();
    SelectQuery {
        sql: format!(
            "SELECT DISTINCT {name} FROM {} WHERE {name} IS NOT NULL ORDER BY {name}",
            C::TABLE
        ),
        params: Vec::new(),
    }
}

fn with_filter<C: TableColumn>(mut sql: String, filter: &WhereClause<C>) -> SelectQuery {
    if !filter.is_unconstrained() {
        sql.push_str(" WHERE ");
        sql.push_str(&filter.sql());
    }
    SelectQuery { sql, params: filter.params().to_vec() }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Incident {
    pub id: i64,
    pub date: String,
    pub incident_type: String,
    pub severity: String,
    pub status: String,
    pub description: Option<String>,
    pub reported_by: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewIncident {
    #[serde(default)]
    pub id: Option<i64>,
    pub date: String,
    pub incident_type: String,
    pub severity: String,
    pub status: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub reported_by: Option<String>,
}

impl NewIncident {
    /// Check the fields the create form marks as required.
    ///
    /// # Errors
    /// Returns [`DashboardError::Validation`] naming the first blank field.
    pub fn validate(&self) -> Result<(), DashboardError> {
        require_filled(&[
            ("date", &self.date),
            ("incident_type", &self.incident_type),
            ("severity", &self.severity),
            ("status", &self.status),
        ])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncidentUpdate {
    pub date: String,
    pub incident_type: String,
    pub severity: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ticket {
    pub id: i64,
    pub ticket_id: String,
    pub priority: String,
    pub status: String,
    pub category: Option<String>,
    pub subject: String,
    pub description: Option<String>,
    pub created_date: Option<String>,
    pub resolved_date: Option<String>,
    pub assigned_to: Option<String>,
    pub created_at: Option<String>,
}

/// Ticket form contents. Update and delete address the row by `ticket_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewTicket {
    pub ticket_id: String,
    pub priority: String,
    pub status: String,
    #[serde(default)]
    pub category: Option<String>,
    pub subject: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_date: Option<String>,
    #[serde(default)]
    pub resolved_date: Option<String>,
    #[serde(default)]
    pub assigned_to: Option<String>,
}

impl NewTicket {
    /// # Errors
    /// Returns [`DashboardError::Validation`] naming the first blank field.
    pub fn validate(&self) -> Result<(), DashboardError> {
        require_filled(&[
            ("ticket_id", &self.ticket_id),
            ("priority", &self.priority),
            ("status", &self.status),
            ("subject", &self.subject),
        ])
    }
}

fn require_filled(fields: &[(&str, &String)]) -> Result<(), DashboardError> {
    for (name, value) in fields {
        if value.trim().is_empty() {
            return Err(DashboardError::Validation(format!("{name} MUST be provided")));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetMetadata {
    pub id: i64,
    pub dataset_name: String,
    pub category: Option<String>,
    pub source: Option<String>,
    pub last_updated: Option<String>,
    pub record_count: Option<i64>,
    pub file_size_mb: Option<f64>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewDataset {
    pub dataset_name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub record_count: Option<i64>,
    #[serde(default)]
    pub file_size_mb: Option<f64>,
}

/// One bar of an aggregate: a column value (NULL groups as `None`) and its row count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupCount {
    pub value: Option<String>,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChartSeries {
    pub title: String,
    pub x_axis: String,
    pub points: Vec<GroupCount>,
}

#[must_use]
pub fn chart_series<C: TableColumn>(subject: &str, column: C, points: Vec<GroupCount>) -> ChartSeries {
    ChartSeries {
        title: format!("{subject} by {}", column.label()),
        x_axis: column.as_str().to_string(),
        points,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// Per-visitor state carried into every page operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionContext {
    pub logged_in: bool,
    pub username: Option<String>,
    pub role: Option<String>,
    #[serde(default)]
    pub conversation: Vec<ChatMessage>,
}

impl SessionContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sign_in(&mut self, username: impl Into<String>, role: impl Into<String>) {
        self.logged_in = true;
        self.username = Some(username.into());
        self.role = Some(role.into());
    }

    /// Clear every flag and the chat transcript.
    pub fn logout(&mut self) {
        *self = Self::default();
    }

    /// Return the signed-in username.
    ///
    /// # Errors
    /// Returns [`DashboardError::NotLoggedIn`] pointing at the login page.
    pub fn require_login(&self) -> Result<&str, DashboardError> {
        match (&self.username, self.logged_in) {
            (Some(username), true) => Ok(username),
            _ => Err(DashboardError::NotLoggedIn { redirect: LOGIN_PAGE }),
        }
    }

    pub fn push_message(&mut self, message: ChatMessage) {
        self.conversation.push(message);
    }

    /// Conversation as shown to the user: system messages are hidden.
    #[must_use]
    pub fn visible_transcript(&self) -> Vec<ChatMessage> {
        self.conversation
            .iter()
            .filter(|message| message.role != ChatRole::System)
            .cloned()
            .collect()
    }
}
