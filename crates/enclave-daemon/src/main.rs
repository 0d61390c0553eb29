use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use enclave_core::access::Removal;
use enclave_core::mls::NewGroup;
use enclave_core::paths::data_dir;
use enclave_core::Enclave;
use enclave_crypto::PublicKey;
use enclave_proto::event::tag;
use enclave_store::DefaultPolicy;

use enclave_daemon::relay::{RelayPool, RelayTransport, WsFactory};
use enclave_daemon::{start, DaemonConfig, StatusEvent};

#[derive(Parser, Debug)]
#[command(author, version, about = "Darklock Enclave", long_about = None)]
struct Cli {
    /// Data directory (defaults to $ENCLAVE_DATA_DIR or the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create identity, settings and access policy
    Init,
    /// Run the relay daemon for all allowed groups
    Run,
    /// Show the local identity
    Whoami,
    /// Build and publish a key package
    PublishKeyPackage {
        #[arg(long = "relay")]
        relays: Vec<String>,
        #[arg(long)]
        last_resort: bool,
    },
    /// Create a group with this identity as admin
    CreateGroup {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long = "relay")]
        relays: Vec<String>,
        #[arg(long = "admin")]
        admins: Vec<String>,
    },
    /// Add a member using their newest published key package
    Invite {
        #[arg(long)]
        group: String,
        #[arg(long)]
        member: String,
    },
    /// Fetch gift-wrapped welcomes and join their groups
    AcceptWelcomes,
    /// Send a chat message to a group
    Send {
        #[arg(long)]
        group: String,
        #[arg(long)]
        message: String,
        #[arg(long)]
        reply_to: Option<String>,
    },
    /// List stored messages of a group
    Messages {
        #[arg(long)]
        group: String,
    },
    /// List groups
    Groups,
    /// Inspect or change the access policy
    Acl {
        #[command(subcommand)]
        action: AclAction,
    },
    /// Inspect the audit trail
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
}

#[derive(Subcommand, Debug)]
enum AclAction {
    Show,
    AllowContact { key: String },
    RemoveContact { key: String },
    AllowGroup { group: String },
    RevokeGroup { group: String },
    DefaultPolicy { policy: PolicyArg },
    LogRejected { enabled: bool },
}

#[derive(Subcommand, Debug)]
enum AuditAction {
    Show {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Verify,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PolicyArg {
    Ignore,
    LogOnly,
}

impl From<PolicyArg> for DefaultPolicy {
    fn from(p: PolicyArg) -> Self {
        match p {
            PolicyArg::Ignore => DefaultPolicy::Ignore,
            PolicyArg::LogOnly => DefaultPolicy::LogOnly,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    let root = match cli.data_dir {
        Some(dir) => dir,
        None => data_dir()?,
    };
    match cli.command {
        Commands::Init => init_command(root),
        Commands::Run => run_command(root).await,
        Commands::Whoami => whoami_command(root),
        Commands::PublishKeyPackage {
            relays,
            last_resort,
        } => publish_key_package_command(root, relays, last_resort).await,
        Commands::CreateGroup {
            name,
            description,
            relays,
            admins,
        } => create_group_command(root, name, description, relays, admins),
        Commands::Invite { group, member } => invite_command(root, group, member).await,
        Commands::AcceptWelcomes => accept_welcomes_command(root).await,
        Commands::Send {
            group,
            message,
            reply_to,
        } => send_command(root, group, message, reply_to).await,
        Commands::Messages { group } => messages_command(root, group),
        Commands::Groups => groups_command(root),
        Commands::Acl { action } => acl_command(root, action),
        Commands::Audit { action } => audit_command(root, action),
    }
}

fn init_command(root: PathBuf) -> Result<()> {
    let (enclave, created) = Enclave::init(&root)?;
    if created {
        println!("Identity created: {}", enclave.public().to_bech32()?);
    } else {
        println!("Already initialized: {}", enclave.public().to_bech32()?);
    }
    println!("Data directory: {}", root.display());
    Ok(())
}

async fn run_command(root: PathBuf) -> Result<()> {
    let enclave = Enclave::open(&root)?;
    let factory = Arc::new(WsFactory {
        publish_timeout: publish_timeout(&enclave),
    });
    let (status_tx, mut status_rx) = mpsc::unbounded_channel();
    let handle = start(
        &enclave,
        factory,
        DaemonConfig::from_settings(enclave.settings()),
        status_tx,
    )?;
    if handle.groups().is_empty() {
        warn!("no allowed groups to serve");
    }

    let reporter = tokio::spawn(async move {
        while let Some(event) = status_rx.recv().await {
            match &event {
                StatusEvent::Diagnostic { group, error, .. } => {
                    warn!(group = %group, error = %error, "diagnostic")
                }
                StatusEvent::Rejected { group, sender } => {
                    warn!(group = %group, sender = %sender, "message rejected")
                }
                other => info!(group = %other.group(), status = ?other, "status"),
            }
        }
    });

    info!("daemon running");
    signal::ctrl_c().await?;
    info!("daemon stopping");
    handle.shutdown();
    handle.join().await;
    reporter.abort();
    Ok(())
}

fn whoami_command(root: PathBuf) -> Result<()> {
    let enclave = Enclave::open(&root)?;
    let public = enclave.public();
    println!("npub:        {}", public.to_bech32()?);
    println!("hex:         {}", public.to_hex());
    println!("fingerprint: {}", public.fingerprint());
    Ok(())
}

fn publish_timeout(enclave: &Enclave) -> Duration {
    Duration::from_secs(enclave.settings().relays.publish_timeout_secs)
}

async fn connect(enclave: &Enclave, relays: &[String]) -> Result<RelayPool> {
    let relays = enclave.relays_or_default(relays);
    if relays.is_empty() {
        bail!("no relays given and no default relays configured");
    }
    RelayPool::connect(&relays, publish_timeout(enclave))
        .await
        .context("cannot reach any relay")
}

async fn publish_key_package_command(
    root: PathBuf,
    relays: Vec<String>,
    last_resort: bool,
) -> Result<()> {
    let enclave = Enclave::open(&root)?;
    let relays = enclave.relays_or_default(&relays);
    let published = enclave.publish_key_package(&relays, last_resort)?;
    let pool = connect(&enclave, &relays).await?;
    pool.publish(&published.event).await?;
    println!("Key package {} published as {}", published.reference, published.event.id);
    Ok(())
}

fn create_group_command(
    root: PathBuf,
    name: String,
    description: String,
    relays: Vec<String>,
    admins: Vec<String>,
) -> Result<()> {
    let enclave = Enclave::open(&root)?;
    let admins = admins
        .iter()
        .map(|a| PublicKey::parse(a).with_context(|| format!("invalid admin key {a}")))
        .collect::<Result<Vec<_>>>()?;
    let record = enclave.create_group(NewGroup {
        name,
        description,
        relays: enclave.relays_or_default(&relays),
        admins,
    })?;
    println!("Group created: {}", record.mls_group_id);
    println!("Transport id:  {}", record.transport_id);
    Ok(())
}

async fn invite_command(root: PathBuf, group: String, member: String) -> Result<()> {
    let enclave = Enclave::open(&root)?;
    let member = PublicKey::parse(&member).context("invalid member key")?;
    let record = enclave
        .store()
        .load_group(&group)?
        .ok_or_else(|| anyhow!("unknown group {group}"))?;
    let pool = connect(&enclave, &record.relays).await?;

    let mut packages = pool
        .query(Enclave::key_package_filter(member), publish_timeout(&enclave))
        .await?;
    packages.sort_by_key(|e| e.created_at);
    let key_package = packages
        .pop()
        .ok_or_else(|| anyhow!("no key package found for {}", member.short()))?;

    let invitation = enclave.invite(&group, &key_package)?;
    // existing members must see the commit before the newcomer speaks
    pool.publish(&invitation.commit).await?;
    pool.publish(&invitation.welcome).await?;
    println!(
        "Invited {} to {} (epoch {})",
        invitation.invitee.short(),
        group,
        invitation.epoch
    );
    Ok(())
}

async fn accept_welcomes_command(root: PathBuf) -> Result<()> {
    let enclave = Enclave::open(&root)?;
    let pool = connect(&enclave, &[]).await?;
    let wraps = pool
        .query(enclave.welcome_filter(), publish_timeout(&enclave))
        .await?;
    let mut joined = 0;
    for wrap in wraps {
        match enclave.accept_welcome(&wrap) {
            Ok(j) => {
                joined += 1;
                println!(
                    "Joined {} ({}) invited by {}",
                    j.record.name,
                    j.record.mls_group_id,
                    j.inviter.short()
                );
                if let Some(fresh) = j.replacement {
                    pool.publish(&fresh.event).await?;
                    println!("Published replacement key package {}", fresh.reference);
                }
            }
            Err(e) => warn!(event_id = %wrap.id, error = %e, "welcome not usable"),
        }
    }
    pool.close().await;
    println!("{joined} group(s) joined");
    Ok(())
}

async fn send_command(
    root: PathBuf,
    group: String,
    message: String,
    reply_to: Option<String>,
) -> Result<()> {
    let enclave = Enclave::open(&root)?;
    let tags = reply_to
        .map(|id| vec![tag("e", &[id.as_str(), "", "reply"])])
        .unwrap_or_default();
    let sent = enclave.send_message(&group, &message, tags)?;
    let record = enclave
        .store()
        .load_group(&group)?
        .ok_or_else(|| anyhow!("unknown group {group}"))?;
    let pool = connect(&enclave, &record.relays).await?;
    pool.publish(&sent.event).await?;
    println!("Sent {}", sent.message.id);
    Ok(())
}

fn messages_command(root: PathBuf, group: String) -> Result<()> {
    let enclave = Enclave::open(&root)?;
    for m in enclave.messages(&group)? {
        println!("[{}] {}: {}", m.created_at, m.sender.short(), m.content);
    }
    Ok(())
}

fn groups_command(root: PathBuf) -> Result<()> {
    let enclave = Enclave::open(&root)?;
    for g in enclave.groups()? {
        let served = if enclave.access().is_group_allowed(&g.mls_group_id) {
            "allowed"
        } else {
            "not allowed"
        };
        println!(
            "{}  {:<24} epoch {:<4} members {:<3} {}",
            g.mls_group_id, g.name, g.epoch, g.member_count, served
        );
    }
    Ok(())
}

fn acl_command(root: PathBuf, action: AclAction) -> Result<()> {
    let enclave = Enclave::open(&root)?;
    let acl = enclave.access();
    let me = enclave.public();
    match action {
        AclAction::Show => {
            println!("{}", serde_json::to_string_pretty(&acl.snapshot())?);
        }
        AclAction::AllowContact { key } => {
            let key = PublicKey::parse(&key)?;
            if acl.add_contact(&me, &key)? {
                println!("Contact {} allowed", key.short());
            } else {
                println!("Contact {} was already allowed", key.short());
            }
        }
        AclAction::RemoveContact { key } => {
            let key = PublicKey::parse(&key)?;
            match acl.remove_contact(&me, &key)? {
                Removal::Removed => println!("Contact {} removed", key.short()),
                Removal::NotFound => println!("Contact {} was not allowed", key.short()),
            }
        }
        AclAction::AllowGroup { group } => {
            acl.allow_group(&me, &group)?;
            println!("Group {group} allowed");
        }
        AclAction::RevokeGroup { group } => match acl.revoke_group(&me, &group)? {
            Removal::Removed => println!("Group {group} revoked"),
            Removal::NotFound => println!("Group {group} was not allowed"),
        },
        AclAction::DefaultPolicy { policy } => {
            acl.set_default_policy(&me, policy.into())?;
            println!("Default policy set to {policy:?}");
        }
        AclAction::LogRejected { enabled } => {
            acl.set_log_rejected(&me, enabled)?;
            println!("Log rejected: {enabled}");
        }
    }
    Ok(())
}

fn audit_command(root: PathBuf, action: AuditAction) -> Result<()> {
    let enclave = Enclave::open(&root)?;
    let audit = enclave.audit();
    match action {
        AuditAction::Show { limit } => {
            for e in audit.read_recent(limit)? {
                println!(
                    "#{:<5} {} {:<18} {} sender={} group={} {}",
                    e.seq,
                    e.timestamp.to_rfc3339(),
                    e.event_type,
                    if e.allowed { "allowed" } else { "denied " },
                    e.sender.as_deref().unwrap_or("-"),
                    e.group.as_deref().unwrap_or("-"),
                    e.detail
                );
            }
        }
        AuditAction::Verify => {
            let report = audit.verify_chain(&enclave.public())?;
            match report.first_break {
                None => println!(
                    "Audit chain intact: {} entries over {} day(s)",
                    report.entries, report.days
                ),
                Some(b) => bail!("audit chain broken on {} at #{}: {}", b.day, b.seq, b.reason),
            }
        }
    }
    Ok(())
}
