//! DealVault CLI - Command line interface for the secret vault.
//!
//! Local administration tool: bootstrap a database, manage users, vaults
//! and members, store credentials and perform audited reveals.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use dealvault_common::{CredentialId, UserId, VaultId};
use dealvault_crypto::{EngineConfig, Environment, KdfParams};
use dealvault_vault::{
    AuditAction, AuditQuery, AuditTarget, AuditTargetKind, CredentialFilter, CredentialType,
    DealVault, NewCredential, RequestContext, Role, RotationStatus, UserRole,
};

#[derive(Parser)]
#[command(name = "dealvault")]
#[command(about = "DealVault - Encrypted secret vault")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Path to the vault database (":memory:" for a throwaway one).
    #[arg(long, env = "DEALVAULT_DB", default_value = "dealvault.db")]
    db: PathBuf,

    /// Runtime environment: production, development or test.
    #[arg(long = "env", env = "DEALVAULT_ENV", default_value = "production")]
    environment: String,

    /// Master secret. Prompted for when unset in production.
    #[arg(long, env = "DEALVAULT_MASTER_KEY", hide_env_values = true)]
    master_key: Option<String>,

    /// KDF strength: "interactive", "moderate", or "sensitive".
    #[arg(short, long, default_value = "interactive")]
    strength: String,

    /// Email of the acting user.
    #[arg(long = "as", env = "DEALVAULT_USER")]
    actor: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and apply the schema.
    Init,

    /// Register a user.
    AddUser {
        #[arg(short, long)]
        email: String,

        #[arg(short, long)]
        name: String,

        /// Organisation role: admin, ops or member.
        #[arg(short, long, default_value = "member")]
        role: String,
    },

    /// Create a vault. The acting user becomes its admin.
    CreateVault {
        #[arg(short, long)]
        name: String,

        #[arg(short, long)]
        description: Option<String>,
    },

    /// Grant a user a role in a vault.
    AddMember {
        #[arg(long)]
        vault: i64,

        /// Email of the user to add.
        #[arg(short, long)]
        email: String,

        /// Vault role: admin, editor, revealer or viewer.
        #[arg(short, long, default_value = "viewer")]
        role: String,
    },

    /// Store a credential. The secret is read from a prompt.
    AddCredential {
        #[arg(long)]
        vault: i64,

        #[arg(short, long)]
        title: String,

        /// Credential type, e.g. login, api_key, bank_portal.
        #[arg(short = 'k', long = "type", default_value = "login")]
        kind: String,

        #[arg(long)]
        url: Option<String>,

        #[arg(short, long)]
        username: Option<String>,

        #[arg(long)]
        email: Option<String>,

        #[arg(long)]
        notes: Option<String>,

        /// Rotation interval in days.
        #[arg(long)]
        rotate_every: Option<i64>,
    },

    /// List credentials in a vault, masked.
    List {
        #[arg(long)]
        vault: i64,

        /// Search in title and URL.
        #[arg(short, long)]
        search: Option<String>,

        #[arg(short = 'k', long = "type")]
        kind: Option<String>,

        /// Rotation status: no_policy, ok, due_soon or overdue.
        #[arg(long)]
        rotation: Option<String>,
    },

    /// Reveal a credential (audited).
    Reveal {
        id: i64,

        /// Reveal a single field: username, email, secret or notes.
        #[arg(short, long)]
        field: Option<String>,
    },

    /// Record that a field was copied by a client (audited).
    Copy {
        id: i64,

        #[arg(short, long, default_value = "secret")]
        field: String,
    },

    /// Mark a credential's secret as rotated.
    Rotate { id: i64 },

    /// Show credential and rotation counts for a vault.
    Stats {
        #[arg(long)]
        vault: i64,
    },

    /// Read the security audit log.
    Audit(AuditArgs),
}

#[derive(Args)]
struct AuditArgs {
    /// Target kind, e.g. credential, vault, bank_account.
    #[arg(long, requires = "target_id")]
    target_type: Option<String>,

    #[arg(long, requires = "target_type")]
    target_id: Option<i64>,

    /// Filter by action, e.g. reveal_secret, access_denied.
    #[arg(short, long)]
    action: Option<String>,

    /// Filter by actor email.
    #[arg(long)]
    by: Option<String>,

    #[arg(short, long, default_value_t = 1)]
    page: u32,

    #[arg(long, default_value_t = 50)]
    per_page: u32,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let app = open(&cli)?;

    match &cli.command {
        Commands::Init => cmd_init(&cli),
        Commands::AddUser { email, name, role } => cmd_add_user(&app, email, name, role),
        Commands::CreateVault { name, description } => {
            cmd_create_vault(&app, &actor(&app, &cli)?, name, description.as_deref())
        }
        Commands::AddMember { vault, email, role } => {
            cmd_add_member(&app, &actor(&app, &cli)?, VaultId::new(*vault), email, role)
        }
        Commands::AddCredential {
            vault,
            title,
            kind,
            url,
            username,
            email,
            notes,
            rotate_every,
        } => {
            let mut input = NewCredential::new(title.as_str(), kind.parse::<CredentialType>()?);
            input.url = url.clone();
            input.username = username.clone();
            input.email = email.clone();
            input.notes = notes.clone();
            input.rotation_interval_days = *rotate_every;
            cmd_add_credential(&app, &actor(&app, &cli)?, VaultId::new(*vault), input)
        }
        Commands::List {
            vault,
            search,
            kind,
            rotation,
        } => {
            let filter = CredentialFilter {
                credential_type: kind.as_deref().map(str::parse::<CredentialType>).transpose()?,
                rotation_status: rotation.as_deref().map(str::parse::<RotationStatus>).transpose()?,
                search: search.clone(),
                ..Default::default()
            };
            cmd_list(&app, &actor(&app, &cli)?, VaultId::new(*vault), &filter)
        }
        Commands::Reveal { id, field } => {
            cmd_reveal(&app, &actor(&app, &cli)?, CredentialId::new(*id), field.as_deref())
        }
        Commands::Copy { id, field } => {
            cmd_copy(&app, &actor(&app, &cli)?, CredentialId::new(*id), field)
        }
        Commands::Rotate { id } => cmd_rotate(&app, &actor(&app, &cli)?, CredentialId::new(*id)),
        Commands::Stats { vault } => cmd_stats(&app, &actor(&app, &cli)?, VaultId::new(*vault)),
        Commands::Audit(args) => cmd_audit(&app, &actor(&app, &cli)?, args),
    }
}

/// Build the engine and open the database.
fn open(cli: &Cli) -> Result<DealVault> {
    let environment: Environment = cli.environment.parse()?;
    let kdf_params = KdfParams::from_strength(&cli.strength)?;

    let mut config = EngineConfig::new(None, environment).with_kdf_params(kdf_params);
    config.master_secret = match &cli.master_key {
        Some(key) => Some(Zeroizing::new(key.clone())),
        None if environment.is_production() => Some(prompt_secret("Master key: ")?),
        None => None,
    };

    debug!(db = %cli.db.display(), environment = %environment, "Opening vault");
    DealVault::open(&cli.db, &config).context("Failed to open vault")
}

/// Prompt for a secret without echo.
fn prompt_secret(prompt: &str) -> Result<Zeroizing<String>> {
    let secret = rpassword::prompt_password(prompt).context("Failed to read secret")?;
    Ok(Zeroizing::new(secret))
}

fn user_id(app: &DealVault, email: &str) -> Result<UserId> {
    match app.users().find_by_email(email)? {
        Some(user) => Ok(user.id),
        None => bail!("No user with email {}", email),
    }
}

/// Request context for the acting user.
fn actor(app: &DealVault, cli: &Cli) -> Result<RequestContext> {
    let Some(email) = cli.actor.as_deref() else {
        bail!("This command needs an acting user: pass --as <email> or set DEALVAULT_USER");
    };
    Ok(RequestContext::for_actor(user_id(app, email)?).with_client_context("dealvault-cli"))
}

fn cmd_init(cli: &Cli) -> Result<()> {
    println!("Vault database ready at {}", cli.db.display());
    Ok(())
}

fn cmd_add_user(app: &DealVault, email: &str, name: &str, role: &str) -> Result<()> {
    let role: UserRole = role.parse()?;
    let user = app
        .users()
        .create(email, name, role)
        .context("Failed to create user")?;
    println!("User created: #{} {} <{}> ({})", user.id, user.full_name, user.email, user.role.label());
    Ok(())
}

fn cmd_create_vault(app: &DealVault, ctx: &RequestContext, name: &str, description: Option<&str>) -> Result<()> {
    info!("Creating vault: {}", name);
    let vault = app
        .vaults()
        .create(ctx, name, description)
        .context("Failed to create vault")?;
    println!("Vault created successfully!");
    println!("  ID: {}", vault.id);
    println!("  Name: {}", vault.name);
    Ok(())
}

fn cmd_add_member(app: &DealVault, ctx: &RequestContext, vault: VaultId, email: &str, role: &str) -> Result<()> {
    let role: Role = role.parse()?;
    let member = user_id(app, email)?;
    app.vaults()
        .add_member(ctx, vault, member, role)
        .context("Failed to add member")?;
    println!("{} is now {} of vault {} ({})", email, role.label(), vault, role.description());
    Ok(())
}

fn cmd_add_credential(app: &DealVault, ctx: &RequestContext, vault: VaultId, mut input: NewCredential) -> Result<()> {
    let secret = prompt_secret("Secret (leave empty for none): ")?;
    if !secret.trim().is_empty() {
        let confirm = prompt_secret("Confirm secret: ")?;
        if secret != confirm {
            bail!("Secrets do not match");
        }
        input.secret = Some(secret.to_string());
    }

    let credential = app
        .credentials()
        .create(ctx, vault, input)
        .context("Failed to store credential")?;
    let summary = credential.summary(chrono::Utc::now());
    println!("Credential stored: #{} {}", summary.id, summary.title);
    if let Some(masked) = summary.secret {
        println!("  Secret: {}", masked);
    }
    Ok(())
}

fn cmd_list(app: &DealVault, ctx: &RequestContext, vault: VaultId, filter: &CredentialFilter) -> Result<()> {
    let credentials = app
        .credentials()
        .list(ctx, vault, filter)
        .context("Failed to list credentials")?;

    if credentials.is_empty() {
        println!("No credentials.");
        return Ok(());
    }
    for c in credentials {
        println!(
            "  #{:<5} {:<32} {:<16} {:<10} {}",
            c.id,
            c.title,
            c.credential_type.label(),
            c.rotation_status.label(),
            c.secret.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn cmd_reveal(app: &DealVault, ctx: &RequestContext, id: CredentialId, field: Option<&str>) -> Result<()> {
    let show = |label: &str, value: Option<&dealvault_common::SensitiveString>| {
        if let Some(value) = value {
            println!("{:<10} {}", label, value.expose());
        }
    };

    match field {
        Some(name) => {
            let value = app
                .credentials()
                .reveal_field(ctx, id, name)
                .context("Reveal refused")?;
            match value {
                Some(value) => println!("{}", value.expose()),
                None => bail!("No readable {} on credential {}", name, id),
            }
        }
        None => {
            let revealed = app.credentials().reveal(ctx, id).context("Reveal refused")?;
            println!("{}", revealed.title);
            show("username", revealed.username.as_ref());
            show("email", revealed.email.as_ref());
            show("secret", revealed.secret.as_ref());
            show("notes", revealed.notes.as_ref());
            for field in &revealed.fields {
                show(field.label.as_str(), field.value.as_ref());
            }
        }
    }
    Ok(())
}

fn cmd_copy(app: &DealVault, ctx: &RequestContext, id: CredentialId, field: &str) -> Result<()> {
    app.credentials()
        .copy(ctx, id, field)
        .context("Copy refused")?;
    println!("Recorded copy of '{}' from credential {}", field, id);
    Ok(())
}

fn cmd_rotate(app: &DealVault, ctx: &RequestContext, id: CredentialId) -> Result<()> {
    let credential = app
        .credentials()
        .mark_secret_rotated(ctx, id)
        .context("Failed to mark secret rotated")?;
    println!(
        "Marked '{}' rotated; next rotation in {} days",
        credential.title,
        credential
            .days_until_rotation(chrono::Utc::now())
            .map_or_else(|| "-".to_string(), |d| d.to_string())
    );
    Ok(())
}

fn cmd_stats(app: &DealVault, ctx: &RequestContext, vault: VaultId) -> Result<()> {
    let stats = app
        .vaults()
        .stats(ctx, vault, chrono::Utc::now())
        .context("Failed to compute vault stats")?;
    println!("Credentials:   {}", stats.credential_count);
    println!("Overdue:       {}", stats.overdue_rotation_count);
    println!("Due soon:      {}", stats.due_soon_rotation_count);
    Ok(())
}

fn cmd_audit(app: &DealVault, ctx: &RequestContext, args: &AuditArgs) -> Result<()> {
    let mut query = AuditQuery::all().page(args.page, args.per_page);
    if let (Some(kind), Some(id)) = (&args.target_type, args.target_id) {
        query = query.for_target(AuditTarget::from_parts(kind.parse::<AuditTargetKind>()?, id));
    }
    if let Some(action) = &args.action {
        query = query.actions([action.parse::<AuditAction>()?]);
    }
    if let Some(email) = &args.by {
        query = query.by_actor(user_id(app, email)?);
    }

    let log = app.audit_log();
    let page = log.query(ctx, &query).context("Failed to read audit log")?;

    println!("Page {} ({} of {} records)", page.page, page.records.len(), page.total);
    for record in &page.records {
        println!(
            "  {}  {:<22} {}",
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.action.as_str(),
            log.summarize(record)?
        );
    }
    Ok(())
}
