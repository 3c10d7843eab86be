use std::{collections::HashSet, path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use talkroom_api::{Affiliation, DeleteAccountRequest, ErrorBody, Message};
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use crate::auth::{self, RateLimiter, SignUpOutcome};
use crate::backend::{Backend, Credential, OAuthProvider};
use crate::config::Config;
use crate::profiles::{self, ProfileUpdate};
use crate::session::{Session, SessionStore};
use crate::sync::{MessageLog, RoomSynchronizer, SyncEvent};
use crate::{api, files, rooms};

/// Command line interface for the talkroom client.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Override server port.
    #[arg(long, global = true)]
    pub port: Option<u16>,
    /// Override bind address (host:port).
    #[arg(long, global = true)]
    pub bind: Option<String>,
    /// Enable or disable logging (true/false).
    #[arg(long, global = true)]
    pub logging: Option<bool>,
    /// Backend project URL.
    #[arg(long, global = true)]
    pub backend_url: Option<String>,
    /// Directory for local state.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create an account.
    Signup {
        email: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Sign in with email and password.
    Login {
        email: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Sign out and forget the stored session.
    Logout,
    /// Print the provider login URL.
    OauthUrl {
        #[arg(default_value = "google")]
        provider: OAuthProvider,
        #[arg(long)]
        redirect_to: Option<String>,
    },
    /// Email a password reset link.
    ResetPassword { email: String },
    /// Sign in with the tokens from a reset link.
    Recover {
        access_token: String,
        refresh_token: String,
    },
    /// Set a new password.
    UpdatePassword {
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        confirm: Option<String>,
    },
    /// Show the signed in account.
    Whoami,
    /// Operations on the own profile.
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
    /// Operations on the account.
    Account {
        #[command(subcommand)]
        command: AccountCommand,
    },
    /// Operations on rooms.
    Rooms {
        #[command(subcommand)]
        command: RoomsCommand,
    },
    /// Open a live view of a room. Lines typed are sent; `/quit` leaves.
    Chat { room: Uuid },
    /// Run the first-party HTTP endpoints.
    Serve,
}

#[derive(Subcommand, Debug)]
pub enum ProfileCommand {
    Show,
    Update {
        #[arg(long)]
        name: String,
        /// faculty, student or other.
        #[arg(long)]
        affiliation: Affiliation,
        #[arg(long)]
        year: Option<u8>,
        #[arg(long)]
        course: Option<String>,
    },
    /// Upload a new avatar image.
    Avatar { path: PathBuf },
}

#[derive(Subcommand, Debug)]
pub enum AccountCommand {
    /// Change the email address.
    Email { email: String },
    /// Permanently delete the account.
    Delete {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum RoomsCommand {
    List,
    Create {
        name: String,
        #[arg(long)]
        icon: Option<PathBuf>,
    },
    /// Join with an invite code or link.
    Join { code: String },
    Rename { room: Uuid, name: String },
    Leave { room: Uuid },
    Members { room: Uuid },
}

async fn read_secret(prompt: &str, given: Option<String>) -> Result<String> {
    if let Some(value) = given {
        return Ok(value);
    }
    eprint!("{prompt}: ");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("reading from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Load the stored session, refreshing and re-saving it when close to expiry.
async fn current_session(backend: &dyn Backend, store: &SessionStore) -> Result<Session> {
    let stored = store.require().await?;
    let fresh = auth::ensure_fresh(backend, &stored).await?;
    if fresh != stored {
        store.save(&fresh).await?;
    }
    Ok(fresh)
}

/// Accept either a bare code or a full `/chat/join/{code}` link.
fn invite_code(input: &str) -> &str {
    let input = input.trim().trim_end_matches('/');
    match input.rsplit_once("/chat/join/") {
        Some((_, code)) => code,
        None => input,
    }
}

/// Where a password reset link lands: the page that sets the new password.
fn reset_redirect(site_url: &str) -> String {
    format!("{site_url}/login/update-password")
}

/// Messages already written to the terminal. Pushed messages can land
/// before ones already shown, so the log is diffed by id, not by position.
#[derive(Default)]
struct Transcript {
    printed: HashSet<Uuid>,
}

impl Transcript {
    fn unseen<'a>(&mut self, log: &'a MessageLog) -> Vec<&'a Message> {
        log.iter().filter(|m| self.printed.insert(m.id)).collect()
    }
}

fn print_message(m: &Message) {
    let who = m
        .user
        .as_ref()
        .map(|u| u.display_name())
        .unwrap_or_else(|| m.user_id.simple().to_string()[..8].to_string());
    println!(
        "[{:02}:{:02}] {}: {}",
        m.created_at.hour(),
        m.created_at.minute(),
        who,
        m.content
    );
}

pub async fn run(cli: Cli, config: Config) -> Result<()> {
    let backend = config.connect()?;
    let store = SessionStore::new(&config.data_dir);
    let b = backend.as_ref();

    match cli.command {
        Command::Serve => api::run_http_server(backend.clone(), config.clone()).await?,
        Command::Signup { email, password } => {
            let password = read_secret("password", password).await?;
            match auth::sign_up(b, &email, &password).await? {
                SignUpOutcome::SignedIn(session) => {
                    store.save(&session).await?;
                    println!("signed up and signed in as {email}");
                }
                SignUpOutcome::ConfirmationPending(_) => {
                    println!("check {email} for a confirmation link, then log in");
                }
            }
        }
        Command::Login { email, password } => {
            let password = read_secret("password", password).await?;
            let session = auth::sign_in(b, &email, &password).await?;
            store.save(&session).await?;
            println!("signed in as {email}");
        }
        Command::Logout => {
            if let Some(session) = store.load().await? {
                if let Err(e) = auth::sign_out(b, &session).await {
                    tracing::warn!(error = %e, "remote sign out failed");
                }
            }
            store.clear().await?;
            println!("signed out");
        }
        Command::OauthUrl {
            provider,
            redirect_to,
        } => {
            let redirect = redirect_to.unwrap_or_else(|| format!("{}/chat", config.site_url));
            println!("{}", auth::oauth_url(b, provider, &redirect)?);
        }
        Command::ResetPassword { email } => {
            let redirect = reset_redirect(&config.site_url);
            let limiter = RateLimiter::password_reset(&config.data_dir);
            auth::request_password_reset(b, &limiter, &email, Some(&redirect)).await?;
            println!("if {email} has an account, a reset link is on its way");
        }
        Command::Recover {
            access_token,
            refresh_token,
        } => {
            let session = auth::session_from_reset_link(b, &access_token, &refresh_token).await?;
            store.save(&session).await?;
            println!("signed in; set a new password with `update-password`");
        }
        Command::UpdatePassword { password, confirm } => {
            let session = current_session(b, &store).await?;
            let password = read_secret("new password", password).await?;
            let confirm = read_secret("confirm password", confirm).await?;
            auth::update_password(b, &session, &password, &confirm).await?;
            println!("password updated");
        }
        Command::Whoami => match store.load().await? {
            Some(session) => println!(
                "{} {}",
                session.user_id(),
                session.user.email.as_deref().unwrap_or("")
            ),
            None => println!("not signed in"),
        },
        Command::Profile { command } => {
            let session = current_session(b, &store).await?;
            match command {
                ProfileCommand::Show => {
                    let profile = profiles::fetch_or_create(b, &session).await?;
                    println!("{}", serde_json::to_string_pretty(&profile)?);
                }
                ProfileCommand::Update {
                    name,
                    affiliation,
                    year,
                    course,
                } => {
                    let profile = profiles::update(
                        b,
                        &session,
                        ProfileUpdate {
                            name: Some(name),
                            affiliation: Some(affiliation),
                            student_year: year,
                            student_course: course,
                        },
                    )
                    .await?;
                    println!("{}", serde_json::to_string_pretty(&profile)?);
                }
                ProfileCommand::Avatar { path } => {
                    let upload = files::read_image(&path, config.max_upload_bytes()).await?;
                    let profile = profiles::set_avatar(b, &session, upload).await?;
                    println!("{}", profile.avatar_url.unwrap_or_default());
                }
            }
        }
        Command::Account { command } => {
            let session = current_session(b, &store).await?;
            match command {
                AccountCommand::Email { email } => {
                    auth::update_email(b, &session, &email).await?;
                    println!("check {email} to confirm the change");
                }
                AccountCommand::Delete { yes } => {
                    if !yes {
                        bail!("pass --yes to permanently delete the account");
                    }
                    delete_account(&config, &session).await?;
                    store.clear().await?;
                    println!("account deleted");
                }
            }
        }
        Command::Rooms { command } => {
            let session = current_session(b, &store).await?;
            match command {
                RoomsCommand::List => {
                    for room in rooms::list_for_user(b, &session).await? {
                        println!("{}  {}", room.id, room.name);
                    }
                }
                RoomsCommand::Create { name, icon } => {
                    let icon = match icon {
                        Some(path) => Some(files::read_image(&path, config.max_upload_bytes()).await?),
                        None => None,
                    };
                    let created = rooms::create(b, &session, &name, icon, &config.site_url).await?;
                    println!("{}  {}", created.room.id, created.room.name);
                    println!("invite: {}", created.invite_link);
                }
                RoomsCommand::Join { code } => {
                    let room = rooms::join_by_code(
                        b,
                        &session,
                        invite_code(&code),
                        config.chat.membership_limit,
                    )
                    .await?;
                    println!("joined {room}");
                }
                RoomsCommand::Rename { room, name } => {
                    let room = rooms::rename(b, &session, room, &name).await?;
                    println!("{}  {}", room.id, room.name);
                }
                RoomsCommand::Leave { room } => {
                    if rooms::leave(b, &session, room).await? {
                        println!("left {room}; it had no members left and was deleted");
                    } else {
                        println!("left {room}");
                    }
                }
                RoomsCommand::Members { room } => {
                    for m in rooms::members(b, Credential::User(&session), room).await? {
                        let name = m.user.map(|u| u.display_name()).unwrap_or_default();
                        println!("{}  {}", m.user_id, name);
                    }
                }
            }
        }
        Command::Chat { room } => {
            let session = current_session(b, &store).await?;
            chat(backend.clone(), session, &config, &store, room).await?;
        }
    }
    Ok(())
}

/// Ask the first-party endpoint to delete the account; it holds the
/// privileged key.
async fn delete_account(config: &Config, session: &Session) -> Result<()> {
    let url = format!("http://{}/api/delete-account", config.bind);
    let resp = reqwest::Client::new()
        .post(&url)
        .bearer_auth(&session.access_token)
        .json(&DeleteAccountRequest {
            user_id: Some(session.user_id()),
        })
        .send()
        .await
        .with_context(|| format!("contacting {url}"))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body: Option<ErrorBody> = resp.json().await.ok();
        bail!(
            "account deletion failed ({status}): {}",
            body.map(|b| b.error).unwrap_or_default()
        );
    }
    Ok(())
}

async fn chat(
    backend: Arc<dyn Backend>,
    session: Session,
    config: &Config,
    store: &SessionStore,
    room: Uuid,
) -> Result<()> {
    let sync = RoomSynchronizer::new(backend, session, config.chat.clone());
    let mut events = sync.events();
    sync.switch_room(room).await;

    let view = sync.view();
    if let Some(r) = &view.room {
        println!("== {} ({} members) ==", r.name, view.members.len());
    }
    let mut transcript = Transcript::default();
    for m in transcript.unseen(&view.messages) {
        print_message(m);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "/quit" => break,
                Some(line) => {
                    if let Err(e) = sync.send(&line).await {
                        eprintln!("send failed: {e}");
                    }
                }
                None => break,
            },
            ev = events.next() => match ev {
                Some(Ok(SyncEvent::MessagesAdded { .. })) => {
                    let view = sync.view();
                    for m in transcript.unseen(&view.messages) {
                        print_message(m);
                    }
                }
                Some(Ok(SyncEvent::UnreadChanged(n))) if n > 0 => eprintln!("({n} unread)"),
                Some(Ok(SyncEvent::RoomChanged)) => {
                    if let Some(r) = sync.view().room {
                        eprintln!("room is now called {}", r.name);
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => tracing::debug!(error = %e, "event stream lagged"),
                None => break,
            },
        }
    }
    sync.stop();
    store.save(&sync.session()).await?;
    Ok(())
}
