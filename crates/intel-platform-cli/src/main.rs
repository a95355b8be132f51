use std::io::Write;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use intel_platform_api::{DashboardApi, DEFAULT_DB_PATH, DEFAULT_INCIDENTS_CSV};
use intel_platform_assistant::{
    AssistantArgs, CancelHandle, ChatAssistant, ChatEvent, STREAM_CHANNEL_CAPACITY,
};
use intel_platform_core::{
    ChatMessage, DashboardError, IncidentColumn, IncidentFilter, IncidentUpdate, NewDataset,
    NewIncident, NewTicket, TableColumn, TicketColumn, TicketFilter,
};
use serde_json::Value;
use time::format_description::well_known::Iso8601;
use time::Date;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "intel")]
#[command(about = "Intelligence platform dashboard CLI")]
struct Cli {
    #[arg(long, default_value = DEFAULT_DB_PATH)]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Import {
        #[command(subcommand)]
        command: Box<ImportCommand>,
    },
    Incident {
        #[command(subcommand)]
        command: Box<IncidentCommand>,
    },
    Ticket {
        #[command(subcommand)]
        command: Box<TicketCommand>,
    },
    User {
        #[command(subcommand)]
        command: Box<UserCommand>,
    },
    Dataset {
        #[command(subcommand)]
        command: Box<DatasetCommand>,
    },
    /// Ask the IT expert assistant one question and stream the answer to stdout.
    Chat(Box<ChatArgs>),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    Init,
    Status,
}

#[derive(Debug, Subcommand)]
enum ImportCommand {
    Csv(ImportCsvArgs),
}

#[derive(Debug, Args)]
struct ImportCsvArgs {
    #[arg(long, default_value = DEFAULT_INCIDENTS_CSV)]
    path: PathBuf,
}

#[derive(Debug, Subcommand)]
enum IncidentCommand {
    Add(IncidentAddArgs),
    Update(IncidentUpdateArgs),
    Delete(IncidentIdArgs),
    Show(IncidentIdArgs),
    List(IncidentFilterArgs),
    Groups(IncidentGroupsArgs),
    Count(IncidentFilterArgs),
    /// Drop the `cyber_incidents` table.
    Drop,
}

#[derive(Debug, Args)]
struct IncidentAddArgs {
    #[arg(long)]
    id: Option<i64>,
    #[command(flatten)]
    fields: IncidentFieldArgs,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    reported_by: Option<String>,
}

#[derive(Debug, Args)]
struct IncidentUpdateArgs {
    #[arg(long)]
    id: i64,
    #[command(flatten)]
    fields: IncidentFieldArgs,
}

#[derive(Debug, Args)]
struct IncidentFieldArgs {
    #[arg(long)]
    date: String,
    #[arg(long)]
    incident_type: String,
    #[arg(long)]
    severity: String,
    #[arg(long)]
    status: String,
}

#[derive(Debug, Args)]
struct IncidentIdArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
struct IncidentFilterArgs {
    #[arg(long, value_parser = parse_date)]
    date_from: Option<Date>,
    #[arg(long, value_parser = parse_date)]
    date_to: Option<Date>,
    #[arg(long = "incident-type")]
    incident_types: Vec<String>,
    #[arg(long = "severity")]
    severities: Vec<String>,
    #[arg(long = "status")]
    statuses: Vec<String>,
}

#[derive(Debug, Args)]
struct IncidentGroupsArgs {
    #[arg(long, value_parser = IncidentColumn::parse_checked)]
    column: IncidentColumn,
    #[command(flatten)]
    filter: IncidentFilterArgs,
}

#[derive(Debug, Subcommand)]
enum TicketCommand {
    Add(TicketArgs),
    Update(TicketArgs),
    Delete(TicketIdArgs),
    Show(TicketIdArgs),
    List(TicketFilterArgs),
    Groups(TicketGroupsArgs),
    Count(TicketFilterArgs),
    /// Tickets per created date.
    Dates(TicketFilterArgs),
}

#[derive(Debug, Args)]
struct TicketArgs {
    #[arg(long)]
    ticket_id: String,
    #[arg(long)]
    priority: String,
    #[arg(long)]
    status: String,
    #[arg(long)]
    subject: String,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    created_date: Option<String>,
    #[arg(long)]
    resolved_date: Option<String>,
    #[arg(long)]
    assigned_to: Option<String>,
}

#[derive(Debug, Args)]
struct TicketIdArgs {
    #[arg(long)]
    ticket_id: String,
}

#[derive(Debug, Args)]
struct TicketFilterArgs {
    #[arg(long, value_parser = parse_date)]
    created_from: Option<Date>,
    #[arg(long, value_parser = parse_date)]
    created_to: Option<Date>,
    #[arg(long = "status")]
    statuses: Vec<String>,
    #[arg(long = "priority")]
    priorities: Vec<String>,
    #[arg(long = "subject")]
    subjects: Vec<String>,
    #[arg(long)]
    id_start: Option<i64>,
    #[arg(long)]
    id_end: Option<i64>,
}

#[derive(Debug, Args)]
struct TicketGroupsArgs {
    #[arg(long, value_parser = TicketColumn::parse_checked)]
    column: TicketColumn,
    #[command(flatten)]
    filter: TicketFilterArgs,
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    Add(UserAddArgs),
}

#[derive(Debug, Args)]
struct UserAddArgs {
    #[arg(long)]
    username: String,
    #[arg(long)]
    password: String,
    #[arg(long)]
    role: Option<String>,
}

#[derive(Debug, Subcommand)]
enum DatasetCommand {
    Add(DatasetAddArgs),
    List,
}

#[derive(Debug, Args)]
struct DatasetAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    last_updated: Option<String>,
    #[arg(long)]
    record_count: Option<i64>,
    #[arg(long)]
    file_size_mb: Option<f64>,
}

#[derive(Debug, Args)]
struct ChatArgs {
    #[arg(long)]
    prompt: String,
    #[command(flatten)]
    assistant: AssistantArgs,
}

impl IncidentFilterArgs {
    fn into_filter(self) -> IncidentFilter {
        IncidentFilter {
            date_from: self.date_from,
            date_to: self.date_to,
            incident_types: self.incident_types,
            severities: self.severities,
            statuses: self.statuses,
        }
    }
}

impl TicketFilterArgs {
    fn into_filter(self) -> TicketFilter {
        TicketFilter {
            created_from: self.created_from,
            created_to: self.created_to,
            statuses: self.statuses,
            priorities: self.priorities,
            subjects: self.subjects,
            id_start: self.id_start,
            id_end: self.id_end,
        }
    }
}

impl From<TicketArgs> for NewTicket {
    fn from(args: TicketArgs) -> Self {
        Self {
            ticket_id: args.ticket_id,
            priority: args.priority,
            status: args.status,
            category: args.category,
            subject: args.subject,
            description: args.description,
            created_date: args.created_date,
            resolved_date: args.resolved_date,
            assigned_to: args.assigned_to,
        }
    }
}

fn parse_date(value: &str) -> Result<Date, time::error::Parse> {
    Date::parse(value, &Iso8601::DATE)
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let api = DashboardApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Import { command } => run_import(*command, &api),
        Command::Incident { command } => run_incident(*command, &api),
        Command::Ticket { command } => run_ticket(*command, &api),
        Command::User { command } => run_user(*command, &api),
        Command::Dataset { command } => run_dataset(*command, &api),
        Command::Chat(args) => run_chat(*args),
    }
}

fn run_db(command: DbCommand, api: &DashboardApi) -> Result<()> {
    let status = match command {
        DbCommand::Init => api.init_schema()?,
        DbCommand::Status => api.status()?,
    };
    emit_json(serde_json::json!({
        "db": api.db_path().display().to_string(),
        "tables": status.tables
    }))
}

fn run_import(command: ImportCommand, api: &DashboardApi) -> Result<()> {
    match command {
        ImportCommand::Csv(args) => {
            let summary = api.import_incidents_csv(&args.path)?;
            emit_json(serde_json::json!({
                "path": args.path.display().to_string(),
                "imported_rows": summary.imported_rows
            }))
        }
    }
}

fn run_incident(command: IncidentCommand, api: &DashboardApi) -> Result<()> {
    match command {
        IncidentCommand::Add(args) => {
            let incident = NewIncident {
                id: args.id,
                date: args.fields.date,
                incident_type: args.fields.incident_type,
                severity: args.fields.severity,
                status: args.fields.status,
                description: args.description,
                reported_by: args.reported_by,
            };
            incident.validate()?;
            let id = api.add_incident(&incident)?;
            emit_json(serde_json::json!({ "id": id }))
        }
        IncidentCommand::Update(args) => {
            let update = IncidentUpdate {
                date: args.fields.date,
                incident_type: args.fields.incident_type,
                severity: args.fields.severity,
                status: args.fields.status,
            };
            let updated = api.update_incident(args.id, &update)?;
            emit_json(serde_json::json!({ "id": args.id, "updated": updated }))
        }
        IncidentCommand::Delete(args) => {
            let deleted = api.delete_incident(args.id)?;
            emit_json(serde_json::json!({ "id": args.id, "deleted": deleted }))
        }
        IncidentCommand::Show(args) => {
            let incident = api
                .incident(args.id)?
                .ok_or_else(|| anyhow!("incident {} not found", args.id))?;
            emit_json(serde_json::to_value(incident)?)
        }
        IncidentCommand::List(args) => {
            let incidents = api.list_incidents(&args.into_filter())?;
            emit_json(serde_json::json!({
                "row_count": incidents.len(),
                "incidents": incidents
            }))
        }
        IncidentCommand::Groups(args) => {
            let groups = api.incident_groups(args.column, &args.filter.into_filter())?;
            emit_json(serde_json::json!({
                "column": args.column.as_str(),
                "groups": groups
            }))
        }
        IncidentCommand::Count(args) => {
            let count = api.count_incidents(&args.into_filter())?;
            emit_json(serde_json::json!({ "count": count }))
        }
        IncidentCommand::Drop => {
            api.drop_incidents_table()?;
            emit_json(serde_json::json!({ "dropped": true }))
        }
    }
}

fn run_ticket(command: TicketCommand, api: &DashboardApi) -> Result<()> {
    match command {
        TicketCommand::Add(args) => {
            let ticket = NewTicket::from(args);
            ticket.validate()?;
            let id = api
                .add_ticket(&ticket)
                .with_context(|| format!("failed to create ticket '{}'", ticket.ticket_id))?;
            emit_json(serde_json::json!({ "id": id, "ticket_id": ticket.ticket_id }))
        }
        TicketCommand::Update(args) => {
            let ticket = NewTicket::from(args);
            ticket.validate()?;
            let updated = api.update_ticket(&ticket)?;
            emit_json(serde_json::json!({ "ticket_id": ticket.ticket_id, "updated": updated }))
        }
        TicketCommand::Delete(args) => {
            let deleted = api.delete_ticket(&args.ticket_id)?;
            emit_json(serde_json::json!({ "ticket_id": args.ticket_id, "deleted": deleted }))
        }
        TicketCommand::Show(args) => {
            let ticket = api
                .ticket(&args.ticket_id)?
                .ok_or_else(|| anyhow!("ticket '{}' not found", args.ticket_id))?;
            emit_json(serde_json::to_value(ticket)?)
        }
        TicketCommand::List(args) => {
            let tickets = api.list_tickets(&args.into_filter())?;
            emit_json(serde_json::json!({
                "row_count": tickets.len(),
                "tickets": tickets
            }))
        }
        TicketCommand::Groups(args) => {
            let groups = api.ticket_groups(args.column, &args.filter.into_filter())?;
            emit_json(serde_json::json!({
                "column": args.column.as_str(),
                "groups": groups
            }))
        }
        TicketCommand::Count(args) => {
            let count = api.count_tickets(&args.into_filter())?;
            emit_json(serde_json::json!({ "count": count }))
        }
        TicketCommand::Dates(args) => {
            let dates = api.ticket_dates(&args.into_filter())?;
            emit_json(serde_json::json!({ "dates": dates }))
        }
    }
}

fn run_user(command: UserCommand, api: &DashboardApi) -> Result<()> {
    match command {
        UserCommand::Add(args) => {
            let id = api.register_user(&args.username, &args.password, args.role.as_deref())?;
            emit_json(serde_json::json!({ "id": id, "username": args.username.trim() }))
        }
    }
}

fn run_dataset(command: DatasetCommand, api: &DashboardApi) -> Result<()> {
    match command {
        DatasetCommand::Add(args) => {
            let dataset = NewDataset {
                dataset_name: args.name,
                category: args.category,
                source: args.source,
                last_updated: args.last_updated,
                record_count: args.record_count,
                file_size_mb: args.file_size_mb,
            };
            let id = api.add_dataset(&dataset)?;
            emit_json(serde_json::json!({ "id": id, "dataset_name": dataset.dataset_name }))
        }
        DatasetCommand::List => {
            let datasets = api.list_datasets()?;
            emit_json(serde_json::json!({ "datasets": datasets }))
        }
    }
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let prompt = args.prompt.trim();
    if prompt.is_empty() {
        return Err(DashboardError::Validation("prompt MUST be provided".to_string()).into());
    }
    let history = vec![ChatMessage::user(prompt)];
    let assistant = ChatAssistant::new(args.assistant.into_config())
        .map_err(|err| anyhow!("failed to configure chat assistant: {err}"))?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(async move {
        let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let cancel = CancelHandle::new();
        let stream = tokio::spawn(async move { assistant.stream_reply(&history, tx, &cancel).await });

        let mut stdout = std::io::stdout().lock();
        while let Some(event) = rx.recv().await {
            match event {
                ChatEvent::Delta(content) => {
                    stdout.write_all(content.as_bytes())?;
                    stdout.flush()?;
                }
                ChatEvent::Done { .. } => writeln!(stdout)?,
                ChatEvent::Error(message) => tracing::warn!(error = %message, "chat stream failed"),
            }
        }

        stream
            .await
            .context("chat task panicked")?
            .map(|_| ())
            .map_err(|err| anyhow!("chat failed: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    // Test IDs: TCLI-001
    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    // Test IDs: TCLI-002
    #[test]
    fn filter_args_parse_dates_and_repeated_values() -> Result<()> {
        let cli = Cli::try_parse_from([
            "intel",
            "ticket",
            "count",
            "--created-from",
            "2024-01-01",
            "--status",
            "open",
            "--status",
            "closed",
            "--id-start",
            "3",
        ])?;
        let Command::Ticket { command } = cli.command else {
            return Err(anyhow!("expected ticket command"));
        };
        let TicketCommand::Count(args) = *command else {
            return Err(anyhow!("expected ticket count"));
        };
        let filter = args.into_filter();
        assert_eq!(filter.created_from, Some(parse_date("2024-01-01")?));
        assert_eq!(filter.statuses, vec!["open".to_string(), "closed".to_string()]);
        assert_eq!(filter.id_start, Some(3));
        assert_eq!(filter.where_clause().params().len(), 4);
        Ok(())
    }

    // Test IDs: TCLI-003
    #[test]
    fn group_column_outside_allow_list_is_rejected() {
        let parsed = Cli::try_parse_from(["intel", "incident", "groups", "--column", "password_hash"]);
        assert!(parsed.is_err());
    }
}
