//! leadline CLI entry point

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use leadline::{
    commands::{
        cmd_add_integration, cmd_add_office, cmd_add_tenant, cmd_check_integration,
        cmd_deactivate_tenant, cmd_init, cmd_list_requests, cmd_list_tenants, cmd_reprocess,
        cmd_serve, cmd_show_request, print_check_result, print_request_detail,
        print_request_list, print_tenant_completions, print_tenants, OfficeOptions,
    },
    config::Config,
    db::{Repository, RequestStatus},
    error::Result,
    pipeline::Pipeline,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "leadline")]
#[command(version, about = "Multi-tenant call webhook ingestion, enrichment and CRM sync", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, env = "LEADLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize leadline configuration and database
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Run the webhook server
    Serve {
        /// Listen address (overrides server.bind_addr)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Manage tenants
    Tenant {
        #[command(subcommand)]
        action: TenantAction,
    },

    /// Manage offices (call-provider accounts)
    Office {
        #[command(subcommand)]
        action: OfficeAction,
    },

    /// Manage CRM integrations
    Crm {
        #[command(subcommand)]
        action: CrmAction,
    },

    /// Inspect requests
    Requests {
        #[command(subcommand)]
        action: RequestsAction,
    },

    /// Run a request through the pipeline again
    ///
    /// Failed requests are reopened first.
    Reprocess {
        /// Tenant ID (use 'leadline tenant list' to list)
        tenant_id: String,

        /// Provider call ID
        call_id: String,

        /// Also release a request stuck in enriching
        #[arg(long)]
        force: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum TenantAction {
    /// Create a tenant and print its webhook secret
    Add {
        /// Display name
        name: String,

        /// Webhook secret (generated when omitted)
        #[arg(long)]
        secret: Option<String>,
    },

    /// List tenants
    List {
        /// Output tenant IDs with descriptions for shell completions
        #[arg(long, value_enum, hide = true)]
        completion: Option<Shell>,
    },

    /// Deactivate a tenant; its webhooks are rejected afterwards
    Deactivate {
        /// Tenant ID
        tenant_id: String,
    },
}

#[derive(Subcommand)]
enum OfficeAction {
    /// Link a call-provider company to a tenant
    Add {
        /// Tenant ID
        tenant_id: String,

        /// Call-provider company ID
        company_id: String,

        /// Name of the environment variable (or [provider.credentials] key) holding the API token
        #[arg(long)]
        credential_ref: String,

        /// Office display name
        #[arg(short, long)]
        name: Option<String>,

        /// Workflow configuration as a JSON object (e.g. scoring_guidance)
        #[arg(long)]
        workflow: Option<String>,
    },
}

#[derive(Subcommand)]
enum CrmAction {
    /// Create or replace a tenant's CRM integration
    Add {
        /// Tenant ID
        tenant_id: String,

        /// Provider name (hubspot, webhook)
        provider: String,

        /// Connector settings as a JSON object (credential_ref, url, field_map, ...)
        #[arg(long, default_value = "{}")]
        settings: String,
    },

    /// Check an integration's credentials and endpoint
    Check {
        /// Tenant ID
        tenant_id: String,

        /// Provider name
        provider: String,
    },
}

#[derive(Subcommand)]
enum RequestsAction {
    /// List a tenant's requests
    List {
        /// Tenant ID
        tenant_id: String,

        /// Only requests in this status
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of requests
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Show one request with its deliveries and analysis log
    Show {
        /// Tenant ID
        tenant_id: String,

        /// Provider call ID
        call_id: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    // Handle init command specially (doesn't need existing config)
    if let Commands::Init { force } = cli.command {
        return handle_init(cli.config, force, cli.json).await;
    }

    // Handle completions command (doesn't need config/db)
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "leadline", &mut std::io::stdout());
        print_completion_extras(shell);
        return Ok(());
    }

    // Load configuration
    let mut config = load_config(cli.config.as_deref())?;

    let db = Repository::connect(&config).await?;
    if !db.is_initialized().await? {
        db.init_schema().await?;
    }

    match cli.command {
        Commands::Init { .. } | Commands::Completions { .. } => unreachable!(),

        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            cmd_serve(config, db).await?;
        }

        Commands::Tenant { action } => match action {
            TenantAction::Add { name, secret } => {
                let created = cmd_add_tenant(&db, &name, secret).await?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&created)?);
                } else {
                    println!("✓ Tenant '{}' created", created.name);
                    println!("  ID: {}", created.id);
                    println!("  Webhook secret: {}", created.webhook_secret);
                    println!("\nThe secret is shown once; configure it with your call provider now.");
                }
            }
            TenantAction::List { completion } => {
                let tenants = cmd_list_tenants(&db).await?;
                if let Some(shell) = completion {
                    print_tenant_completions(&tenants, shell);
                } else if cli.json {
                    println!("{}", serde_json::to_string_pretty(&tenants)?);
                } else {
                    print_tenants(&tenants);
                }
            }
            TenantAction::Deactivate { tenant_id } => {
                let tenant = cmd_deactivate_tenant(&db, &tenant_id).await?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&tenant)?);
                } else {
                    println!("✓ Tenant '{}' deactivated", tenant.name);
                }
            }
        },

        Commands::Office { action } => match action {
            OfficeAction::Add {
                tenant_id,
                company_id,
                credential_ref,
                name,
                workflow,
            } => {
                let options = OfficeOptions {
                    name,
                    credential_ref,
                    workflow,
                };
                let office = cmd_add_office(&db, &tenant_id, &company_id, options).await?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&office)?);
                } else {
                    println!("✓ Office registered for company {}", office.external_company_id);
                    println!("  ID: {}", office.id);
                }
            }
        },

        Commands::Crm { action } => {
            let pipeline = build_pipeline(config, db.clone())?;
            match action {
                CrmAction::Add {
                    tenant_id,
                    provider,
                    settings,
                } => {
                    let integration =
                        cmd_add_integration(&db, pipeline.crm(), &tenant_id, &provider, &settings)
                            .await?;
                    if cli.json {
                        println!("{}", serde_json::to_string_pretty(&integration)?);
                    } else {
                        println!("✓ {} integration saved for tenant {}", provider, tenant_id);
                    }
                }
                CrmAction::Check {
                    tenant_id,
                    provider,
                } => {
                    let result =
                        cmd_check_integration(&db, pipeline.crm(), &tenant_id, &provider).await?;
                    if cli.json {
                        println!("{}", serde_json::to_string_pretty(&result)?);
                    } else {
                        print_check_result(&result);
                    }
                }
            }
        }

        Commands::Requests { action } => match action {
            RequestsAction::List {
                tenant_id,
                status,
                limit,
            } => {
                let status = status.map(|s| s.parse::<RequestStatus>()).transpose()?;
                let list = cmd_list_requests(&db, &tenant_id, status, limit).await?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&list)?);
                } else {
                    print_request_list(&list);
                }
            }
            RequestsAction::Show { tenant_id, call_id } => {
                let detail = cmd_show_request(&db, &tenant_id, &call_id).await?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&detail)?);
                } else {
                    print_request_detail(&detail);
                }
            }
        },

        Commands::Reprocess {
            tenant_id,
            call_id,
            force,
        } => {
            let pipeline = build_pipeline(config, db.clone())?;
            let result = cmd_reprocess(&db, &pipeline, &tenant_id, &call_id, force).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!(
                    "✓ Call {} reprocessed: {} -> {}",
                    result.call_id, result.previous_status, result.status
                );
            }
        }
    }

    Ok(())
}

fn build_pipeline(config: Config, db: Repository) -> Result<Pipeline> {
    Pipeline::from_config(Arc::new(config), db, CancellationToken::new())
}

fn print_completion_extras(shell: Shell) {
    match shell {
        Shell::Zsh => {
            println!();
            println!("{}", r#"# Dynamic completion for tenant IDs"#);
            println!("{}", r#"_leadline_tenant_ids() {"#);
            println!("{}", r#"    local -a entries"#);
            println!(
                "{}",
                r#"    entries=("${(@f)$(leadline tenant list --completion zsh 2>/dev/null)}")"#
            );
            println!("{}", r#"    _describe -t tenants 'tenant ids' entries"#);
            println!("{}", r#"}"#);
            println!("{}", r#"compdef _leadline_tenant_ids 'leadline reprocess'"#);
        }
        Shell::Fish => {
            println!();
            println!("{}", r#"# Dynamic completion for tenant IDs"#);
            println!(
                "{}",
                r#"complete -c leadline -n '__fish_seen_subcommand_from reprocess deactivate' -a '(leadline tenant list --completion fish 2>/dev/null)'"#
            );
        }
        _ => {}
    }
}

async fn handle_init(config: Option<PathBuf>, force: bool, json: bool) -> Result<()> {
    // A .toml path names the file; anything else names the base directory
    let base_dir = config.map(|path| {
        if path.extension().is_some_and(|e| e == "toml") {
            path.parent()
                .map(PathBuf::from)
                .unwrap_or_else(Config::default_base_dir)
        } else {
            path
        }
    });

    let info = cmd_init(base_dir, force).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("✓ leadline initialized successfully");
    println!("  Config: {}", info.config_path);
    println!("  Database: {}", info.db_path);
    println!("\nNext steps:");
    println!("  1. Edit the config file (provider, transcription and analysis endpoints)");
    println!("  2. Create a tenant: leadline tenant add \"Acme Roofing\"");
    println!("  3. Link an office: leadline office add <tenant-id> <company-id> --credential-ref ACME_TOKEN");
    println!("  4. Start the server: leadline serve");

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let config_path = path
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_config_path);

    if !config_path.exists() {
        eprintln!(
            "Config file not found: {}\nRun 'leadline init' first.",
            config_path.display()
        );
        std::process::exit(1);
    }

    Config::load(&config_path)
}
