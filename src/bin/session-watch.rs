use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use r3alm_auth::ProviderConfig;
use r3alm_session::prelude::*;

#[derive(Parser, Debug)]
#[clap(name = "session-watch", version)]
#[clap(about = "Follow the current r3alm user and print every change", long_about = None)]
struct Cli {
    /// Sign in with this email after startup
    #[clap(long, requires = "password")]
    email: Option<String>,

    #[clap(long, requires = "email")]
    password: Option<String>,

    /// Sign out before exiting
    #[clap(long)]
    logout: bool,

    /// Directory for the stored user. Defaults to R3ALM_SESSION_DIR, then `.r3alm`.
    #[clap(long)]
    session_dir: Option<PathBuf>,
}

fn describe(state: &SessionState) -> String {
    match state {
        SessionState::Unknown => "unknown".to_string(),
        SessionState::Anonymous => "signed out".to_string(),
        SessionState::Provisional(user) => {
            format!("{} <{}> as {} (unconfirmed)", user.id, user.email, user.role)
        }
        SessionState::Authenticated(user) => format!("{} <{}> as {}", user.id, user.email, user.role),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let provider = ProviderConfig::from_env().context("SUPABASE_URL and SUPABASE_ANON_KEY must be set")?;
    let options = SessionOptions::from_env()?;
    let dir = cli
        .session_dir
        .or_else(|| env::var("R3ALM_SESSION_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(".r3alm"));
    let store = FileStore::new(&dir)
        .with_context(|| format!("could not open session directory {}", dir.display()))?;

    let context = SessionContext::connect(&provider, Arc::new(store), options)?;
    context
        .auth()
        .subscribe(|state| println!("session: {}", describe(state)))
        .detach();
    context.start()?;

    if let (Some(email), Some(password)) = (cli.email.as_deref(), cli.password.as_deref()) {
        if let Err(err) = context.auth().login(email, password).await {
            eprintln!("sign-in failed: {}", err);
        }
    }

    tokio::signal::ctrl_c().await?;

    if cli.logout {
        if let Err(err) = context.auth().logout().await {
            eprintln!("remote sign-out failed: {}", err);
        }
    }
    context.auth().shutdown();
    Ok(())
}
