use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::{Input, Password};
use std::sync::Arc;

use bookstore_client::auth::{CredentialStore, RegisterRequest, SessionManager, UserRecord};
use bookstore_client::config::{CliArgs, Command, Config};
use bookstore_client::error::AuthError;
use bookstore_client::http_client::AuthorizedClient;
use bookstore_client::navigation::LogNavigator;
use bookstore_client::profile::{ChangePasswordRequest, ProfileClient, ProfileUpdate};
use bookstore_client::storage;

/// Same rule the registration form enforces
const MIN_PASSWORD_LENGTH: usize = 6;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();
    let config = Config::from_args(&args)?;
    config.validate()?;

    // Initialize logging with a configured level; stdout is reserved for command output
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!(api_url = %config.api_url, db_file = %config.db_file.display(), "Configuration loaded");

    let store = Arc::new(CredentialStore::new(storage::open_or_fallback(Some(
        config.db_file.as_path(),
    ))));
    tracing::debug!(backend = %store.backend(), "Credential store ready");

    let session = SessionManager::new(store, Arc::new(LogNavigator), config.session_options())?;
    session.resume();

    let http = Arc::new(AuthorizedClient::new(
        session.clone(),
        config.http_max_connections,
        config.http_connect_timeout,
        config.http_request_timeout,
    )?);

    if let Err(e) = run(args.command, &session, http).await {
        let message = match e.downcast_ref::<AuthError>() {
            Some(auth_error) => auth_error.user_message(),
            None => format!("{:#}", e),
        };
        tracing::debug!("Command failed: {:?}", e);
        eprintln!("❌ {}", message);
        std::process::exit(1);
    }

    Ok(())
}

async fn run(command: Command, session: &Arc<SessionManager>, http: Arc<AuthorizedClient>) -> Result<()> {
    match command {
        Command::Login { email } => {
            let email = match email {
                Some(email) => email,
                None => Input::new()
                    .with_prompt("Email")
                    .interact_text()
                    .context("Failed to read email")?,
            };
            let password = Password::new()
                .with_prompt("Password")
                .interact()
                .context("Failed to read password")?;

            let logged_in = session.login(&email, &password).await?;
            println!("✅ Logged in as {}", logged_in.user.display_name());
            if logged_in.user.is_admin() {
                println!("   Role: administrator");
            }
        }

        Command::Register => {
            let first_name: String = Input::new()
                .with_prompt("First name")
                .interact_text()
                .context("Failed to read first name")?;
            let last_name: String = Input::new()
                .with_prompt("Last name")
                .interact_text()
                .context("Failed to read last name")?;
            let email: String = Input::new()
                .with_prompt("Email")
                .interact_text()
                .context("Failed to read email")?;
            let password = prompt_new_password("Password")?;
            let phone_number: String = Input::new()
                .with_prompt("Phone number (optional)")
                .allow_empty(true)
                .interact_text()
                .context("Failed to read phone number")?;

            let registered = session
                .register(&RegisterRequest {
                    first_name,
                    last_name,
                    email,
                    password,
                    phone_number: Some(phone_number).filter(|p| !p.trim().is_empty()),
                })
                .await?;
            println!(
                "✅ Account created for {}. Log in to continue.",
                registered.email.as_deref().unwrap_or("new user")
            );
        }

        Command::Logout => {
            session.logout();
            println!("Logged out");
        }

        Command::Whoami => match session.current_user() {
            Some(user) if session.is_logged_in() => print_user(&user),
            _ => println!("Not logged in"),
        },

        Command::Profile {
            first_name,
            last_name,
            phone_number,
        } => {
            let profiles = ProfileClient::new(http);
            let update = ProfileUpdate {
                first_name,
                last_name,
                phone_number,
            };
            let user = if update.is_empty() {
                profiles.get_profile().await?
            } else {
                let user = profiles.update_profile(&update).await?;
                println!("✅ Profile updated");
                user
            };
            print_user(&user);
        }

        Command::ChangePassword => {
            let current_password = Password::new()
                .with_prompt("Current password")
                .interact()
                .context("Failed to read current password")?;
            let new_password = prompt_new_password("New password")?;

            ProfileClient::new(http)
                .change_password(&ChangePasswordRequest {
                    current_password,
                    new_password,
                })
                .await?;
            println!("✅ Password changed");
        }

        Command::Refresh => match session.refresh_token().await? {
            Some(_) => println!("✅ Token refreshed"),
            None => println!("No refresh token stored. Log in again."),
        },

        Command::Get { path } => {
            let request = http.get(&path).build().context("Invalid request path")?;
            let response = http.execute(request).await?;
            let status = response.status();
            let body = response.text().await.context("Failed to read response body")?;

            eprintln!("{}", status);
            match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
                Err(_) => println!("{}", body),
            }
        }
    }

    Ok(())
}

fn prompt_new_password(prompt: &str) -> Result<String> {
    let password = Password::new()
        .with_prompt(prompt)
        .with_confirmation("Confirm password", "Passwords do not match")
        .interact()
        .context("Failed to read password")?;

    if password.chars().count() < MIN_PASSWORD_LENGTH {
        anyhow::bail!("Password must be at least {} characters", MIN_PASSWORD_LENGTH);
    }
    Ok(password)
}

fn print_user(user: &UserRecord) {
    println!("{} <{}>", user.display_name(), user.email);
    println!("   id: {}", user.id);
    if !user.roles.is_empty() {
        let roles: Vec<&str> = user.roles.iter().map(|r| r.name.as_str()).collect();
        println!("   roles: {}", roles.join(", "));
    }
}
