//! gatewarden - authenticated requests against a gateway from the terminal.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use dialoguer::{Input, Password};
use gatewarden::{
    ApiRequest, Config, Credentials, Method, Outcome, Prompt, PromptResolution, PromptSurface, SessionEvent,
    SessionOrchestrator,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

/// gatewarden - device trust, tokens and authenticated gateway requests
#[derive(Parser, Debug)]
#[command(name = "gatewarden")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the config file (TOML, or a JSON gateway descriptor)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send an authenticated request to the gateway
    Request {
        /// HTTP method
        method: Method,
        /// Path relative to the configured prefix, or an absolute gateway URL
        path: String,
        /// Extra header, `Name: value` (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
        /// Request body
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Log in with a username and password
    Login,

    /// End the user session
    Logout {
        /// Only clear local state, don't contact the gateway
        #[arg(long)]
        local: bool,
    },

    /// Remove this device's registration and every stored token
    Deregister {
        /// Only clear local state, don't contact the gateway
        #[arg(long)]
        local: bool,
    },

    /// Show device and session status
    Status,
}

/// Prompts on the controlling terminal.
struct TerminalPrompts;

#[async_trait]
impl PromptSurface for TerminalPrompts {
    async fn resolve(&self, prompt: Prompt) -> PromptResolution {
        let answer = tokio::task::spawn_blocking(move || ask(&prompt)).await;
        match answer {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(e)) => {
                tracing::warn!("Prompt failed: {e}");
                PromptResolution::Cancelled
            }
            Err(e) => {
                tracing::warn!("Prompt task failed: {e}");
                PromptResolution::Cancelled
            }
        }
    }
}

fn ask(prompt: &Prompt) -> Result<PromptResolution> {
    Ok(match prompt {
        Prompt::Credentials => PromptResolution::Credentials(ask_credentials()?),
        Prompt::DeviceLockCode => {
            let code = Password::new()
                .with_prompt("Device lock code")
                .interact()
                .context("Failed to read lock code")?;
            PromptResolution::LockCode(code)
        }
        Prompt::RemoteAuthorization { url } => {
            eprintln!("Open this URL to authorize the device:\n  {url}");
            let code: String = Input::new()
                .with_prompt("Authorization code")
                .allow_empty(true)
                .interact_text()
                .context("Failed to read authorization code")?;
            if code.trim().is_empty() {
                PromptResolution::Cancelled
            } else {
                PromptResolution::AuthorizationCode(code.trim().to_string())
            }
        }
    })
}

fn ask_credentials() -> Result<Credentials> {
    let username: String = Input::new()
        .with_prompt("Username")
        .interact_text()
        .context("Failed to read username")?;
    let password = Password::new()
        .with_prompt("Password")
        .interact()
        .context("Failed to read password")?;
    Ok(Credentials::new(username, password))
}

fn build_request(method: Method, path: String, headers: Vec<String>, data: Option<String>) -> Result<ApiRequest> {
    let mut request = ApiRequest::new(method, path);
    for header in headers {
        let (name, value) = header
            .split_once(':')
            .with_context(|| format!("Header '{header}' is not in `Name: value` form"))?;
        request = request.header(name.trim(), value.trim());
    }
    if let Some(data) = data {
        request = request.body(data);
    }
    Ok(request)
}

async fn run_request(session: &SessionOrchestrator, request: ApiRequest) -> Result<()> {
    // subscribe before submitting so the first interaction event is not missed
    let mut events = session.subscribe();
    let (id, mut rx) = session.submit_channel(request)?;
    tracing::debug!(request_id = %id, "Submitted");

    let outcome = loop {
        tokio::select! {
            outcome = &mut rx => break outcome.context("Request was dropped by the pipeline")?,
            event = events.recv() => match event {
                Ok(SessionEvent::InteractionRequired(kind)) => {
                    tracing::debug!(%kind, "Resolving interaction");
                    session.resume_pending().await?;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break (&mut rx).await.context("Request was dropped by the pipeline")?,
            },
        }
    };

    match outcome {
        Outcome::Success(response) => {
            eprintln!("HTTP {}", response.status);
            println!("{}", response.text());
            Ok(())
        }
        Outcome::Failure(failure) => {
            if let Some(response) = &failure.response {
                eprintln!("HTTP {}", response.status);
                println!("{}", response.text());
            }
            anyhow::bail!("Request failed: {failure}")
        }
        Outcome::Cancelled => anyhow::bail!("Request was cancelled"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gatewarden=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(cli.config.as_deref())?;
    let session = SessionOrchestrator::start_default(config, Arc::new(TerminalPrompts))
        .context("Failed to start the session")?;

    let result = match cli.command {
        Commands::Request {
            method,
            path,
            headers,
            data,
        } => {
            let request = build_request(method, path, headers, data)?;
            run_request(&session, request).await
        }
        Commands::Login => {
            let credentials = tokio::task::spawn_blocking(ask_credentials)
                .await
                .context("Prompt task failed")??;
            session.login(credentials).await.context("Login failed")?;
            println!("Logged in");
            Ok(())
        }
        Commands::Logout { local } => {
            session.logout(!local).await.context("Logout failed")?;
            println!("Logged out");
            Ok(())
        }
        Commands::Deregister { local } => {
            session.deregister(!local).await.context("Deregistration failed")?;
            println!("Device registration removed");
            Ok(())
        }
        Commands::Status => {
            let state = session.session_state().await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
    };

    session.stop();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_command() {
        let cli = Cli::parse_from([
            "gatewarden",
            "request",
            "post",
            "/protected/resource",
            "-H",
            "Accept: application/json",
            "--data",
            "{}",
        ]);
        match cli.command {
            Commands::Request {
                method,
                path,
                headers,
                data,
            } => {
                assert_eq!(method, Method::Post);
                assert_eq!(path, "/protected/resource");
                assert_eq!(headers, vec!["Accept: application/json".to_string()]);
                assert_eq!(data.as_deref(), Some("{}"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn builds_request_with_headers() {
        let request = build_request(
            Method::Get,
            "/a".into(),
            vec!["X-Trace: abc".into(), "Accept:text/plain".into()],
            None,
        )
        .unwrap();
        assert_eq!(
            request.headers,
            vec![
                ("X-Trace".to_string(), "abc".to_string()),
                ("Accept".to_string(), "text/plain".to_string())
            ]
        );
        assert!(build_request(Method::Get, "/a".into(), vec!["bad".into()], None).is_err());
    }
}
