use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use contact_identity_api::{IdentifyRequest, IdentityApi, StoreArgs};
use contact_identity_core::ContactId;
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "cid")]
#[command(about = "Contact identity CLI")]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve an email and/or phone number to its consolidated contact.
    Identify(IdentifyArgs),
    /// Inspect stored contacts.
    Contact {
        #[command(subcommand)]
        command: ContactCommand,
    },
    /// Initialize or check the contact database.
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Args)]
struct IdentifyArgs {
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone_number: Option<i64>,
}

#[derive(Debug, Subcommand)]
enum ContactCommand {
    List,
    Show {
        #[arg(long)]
        id: i64,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    Init,
    IntegrityCheck,
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
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let api = IdentityApi::new(cli.store.load()?);
    match cli.command {
        Command::Identify(args) => run_identify(&api, args),
        Command::Contact { command } => run_contact(&api, command),
        Command::Db { command } => run_db(&api, command),
    }
}

fn run_identify(api: &IdentityApi, args: IdentifyArgs) -> Result<()> {
    let response =
        api.identify(IdentifyRequest { email: args.email, phone_number: args.phone_number })?;
    emit_json(serde_json::to_value(&response).context("failed to serialize identify response")?)
}

fn run_contact(api: &IdentityApi, command: ContactCommand) -> Result<()> {
    match command {
        ContactCommand::List => {
            let contacts = api.list_contacts()?;
            emit_json(serde_json::json!({ "contacts": contacts }))
        }
        ContactCommand::Show { id } => {
            let contact = api.contact_show(ContactId(id))?;
            emit_json(serde_json::to_value(&contact).context("failed to serialize contact")?)
        }
    }
}

fn run_db(api: &IdentityApi, command: DbCommand) -> Result<()> {
    match command {
        DbCommand::Init => {
            api.init_store()?;
            emit_json(serde_json::json!({
                "status": "ok",
                "store": api.config().redacted_descriptor()
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            let healthy = report.quick_check_ok
                && report.foreign_key_violations.is_empty()
                && report.invalid_links.is_empty();
            let mut value =
                serde_json::to_value(&report).context("failed to serialize integrity report")?;
            if let Value::Object(object) = &mut value {
                object.insert("healthy".to_string(), Value::Bool(healthy));
            }
            emit_json(value)
        }
    }
}
