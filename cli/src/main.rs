use std::time::Duration;

use clap::{Parser, Subcommand};
use events::reconcile::{ChatView, Entry, SendState};
use events::{ChatMessage, InboundEvent, MessageId, OutboundEvent, UserId};
use futures_util::{SinkExt, StreamExt};
use reqwest::header::{COOKIE, HeaderMap, HeaderValue};
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Rows of history shown around a send.
const RECENT_HISTORY: usize = 20;

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing session token; pass --session-token or set CHAT_SESSION_TOKEN")]
    MissingSessionToken,
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
    #[error("websocket error: {0}")]
    Ws(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("websocket closed")]
    WsClosed,
    #[error("event decode failed: {0}")]
    Decode(#[from] events::CodecError),
    #[error("timed out waiting for websocket event")]
    Timeout,
    #[error("server returned {status}: {message}")]
    ServerError { status: String, message: String },
    #[error("missing expected field `{0}`")]
    MissingField(&'static str),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for CliError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Ws(Box::new(error))
    }
}

#[derive(Parser, Debug)]
#[command(name = "chat-cli", about = "Chat API and live-channel CLI")]
struct Cli {
    #[arg(long, env = "CHAT_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    #[arg(long, env = "CHAT_SESSION_TOKEN")]
    session_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check `/healthz`.
    Ping,
    /// Print the caller's user id.
    Me,
    /// List conversations, newest activity first.
    Conversations,
    /// Print messages exchanged with a counterpart.
    History {
        counterpart: UserId,
        #[arg(long)]
        after_id: Option<MessageId>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = false)]
        mark_read: bool,
    },
    /// Send one message over the live channel and wait for its echo.
    Send {
        counterpart: UserId,
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Mark messages from a counterpart as read up to an id.
    Read { counterpart: UserId, last_read_id: MessageId },
    /// Print the unread badge total.
    Unread,
    /// Stream live events as JSON lines until interrupted.
    Watch,
}

#[derive(Debug, Clone)]
struct CliContext {
    base_url: String,
    session_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let ctx = CliContext {
        base_url: cli.base_url,
        session_token: cli.session_token,
    };

    match cli.command {
        Command::Ping => run_ping(&ctx).await,
        Command::Me => print_json(&api_request(&ctx, reqwest::Method::GET, "/api/auth/me", None).await?),
        Command::Conversations => {
            print_json(&api_request(&ctx, reqwest::Method::GET, "/api/chat/conversations", None).await?)
        }
        Command::History { counterpart, after_id, limit, mark_read } => {
            let path = history_path(counterpart, after_id, limit, mark_read);
            print_json(&api_request(&ctx, reqwest::Method::GET, &path, None).await?)
        }
        Command::Send { counterpart, text } => run_send(&ctx, counterpart, &text.join(" ")).await,
        Command::Read { counterpart, last_read_id } => {
            let body = serde_json::json!({ "counterpart_id": counterpart, "last_read_id": last_read_id });
            print_json(&api_request(&ctx, reqwest::Method::POST, "/api/chat/read", Some(body)).await?)
        }
        Command::Unread => print_json(&api_request(&ctx, reqwest::Method::GET, "/api/chat/unread", None).await?),
        Command::Watch => run_watch(&ctx).await,
    }
}

async fn run_ping(cli: &CliContext) -> Result<(), CliError> {
    let client = reqwest::Client::new();
    let url = format!("{}/healthz", cli.base_url.trim_end_matches('/'));
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CliError::ServerError {
            status: format!("HTTP {}", status.as_u16()),
            message: "health check failed".to_owned(),
        });
    }
    println!("ok");
    Ok(())
}

async fn run_send(cli: &CliContext, counterpart: UserId, text: &str) -> Result<(), CliError> {
    let me = fetch_me(cli).await?;
    let mut stream = open_channel(cli).await?;

    let mut view = ChatView::new(me, counterpart);
    let recent_path = history_path(counterpart, None, Some(RECENT_HISTORY), false);
    let recent = api_request(cli, reqwest::Method::GET, &recent_path, None).await?;
    view.merge_history(serde_json::from_value::<Vec<ChatMessage>>(recent)?, events::now_ms());

    let (local_id, event) = view.stage_text(text, events::now_ms());
    print_view(&view, me);
    let frame = Message::Text(events::encode_inbound(&event)?.into());
    if let Err(error) = stream.send(frame).await {
        view.transmit_failed(&local_id, error.to_string());
        print_view(&view, me);
        return Err(error.into());
    }

    loop {
        let event = recv_next(&mut stream, Duration::from_secs(10)).await?;
        view.apply(&event, events::now_ms());
        match view.state_of(&local_id) {
            Some(SendState::Confirmed(id)) => {
                eprintln!("sent message {id}");
                print_view(&view, me);
                return Ok(());
            }
            Some(SendState::Failed(reason)) => {
                let message = reason.clone();
                print_view(&view, me);
                return Err(CliError::ServerError { status: "error".to_owned(), message });
            }
            _ => {}
        }
    }
}

/// Print the conversation as rendered, one row per entry.
fn print_view(view: &ChatView, me: UserId) {
    println!("--");
    for entry in view.entries() {
        println!("{}", render_entry(entry, me));
    }
}

fn render_entry(entry: &Entry, me: UserId) -> String {
    match entry {
        Entry::Pending(pending) => format!("[pending] me: {}", pending.content),
        Entry::Confirmed(message) => {
            let who = if message.sender_id == me { "me" } else { "them" };
            let read = if message.sender_id == me && message.is_read { " (read)" } else { "" };
            format!("[{}] {who}: {}{read}", message.id, message.content)
        }
    }
}

async fn run_watch(cli: &CliContext) -> Result<(), CliError> {
    let mut stream = open_channel(cli).await?;
    loop {
        let Some(message) = stream.next().await else {
            return Err(CliError::WsClosed);
        };
        match message? {
            Message::Text(text) => println!("{}", text.as_str()),
            Message::Close(_) => return Err(CliError::WsClosed),
            _ => {}
        }
    }
}

async fn api_request(
    cli: &CliContext,
    method: reqwest::Method,
    path: &str,
    body: Option<Value>,
) -> Result<Value, CliError> {
    let session_token = cli
        .session_token
        .as_deref()
        .ok_or(CliError::MissingSessionToken)?;

    let mut headers = HeaderMap::new();
    headers.insert(
        COOKIE,
        HeaderValue::from_str(&format!("session_token={session_token}"))?,
    );

    let client = reqwest::Client::builder()
        .default_headers(headers)
        .build()?;
    let url = format!("{}{}", cli.base_url.trim_end_matches('/'), path);

    let request = client.request(method, &url);
    let request = if let Some(json) = body {
        request.json(&json)
    } else {
        request
    };

    let response = request.send().await?;
    let status = response.status();
    let value = response
        .json::<Value>()
        .await
        .unwrap_or_else(|_| Value::Null);

    if !status.is_success() {
        return Err(CliError::ServerError {
            status: format!("HTTP {}", status.as_u16()),
            message: value.to_string(),
        });
    }

    Ok(value)
}

async fn fetch_me(cli: &CliContext) -> Result<UserId, CliError> {
    let body = api_request(cli, reqwest::Method::GET, "/api/auth/me", None).await?;
    body.get("user_id")
        .and_then(Value::as_str)
        .and_then(|value| value.parse().ok())
        .ok_or(CliError::MissingField("user_id"))
}

async fn fetch_ws_ticket(cli: &CliContext) -> Result<String, CliError> {
    let body = api_request(cli, reqwest::Method::POST, "/api/auth/ws-ticket", None).await?;
    body.get("ticket")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or(CliError::MissingField("ticket"))
}

/// Connect with a fresh ticket and wait for `connected`.
async fn open_channel(cli: &CliContext) -> Result<WsStream, CliError> {
    let ticket = fetch_ws_ticket(cli).await?;
    let (mut stream, _) = connect_async(ws_url(&cli.base_url, &ticket)?).await?;
    loop {
        if let OutboundEvent::Connected(connected) = recv_next(&mut stream, Duration::from_secs(5)).await? {
            eprintln!("connected as {} ({})", connected.user_id, connected.connection_id);
            return Ok(stream);
        }
    }
}

fn ws_url(base_url: &str, ticket: &str) -> Result<String, CliError> {
    let base_url = base_url.trim_end_matches('/');
    if let Some(rest) = base_url.strip_prefix("http://") {
        return Ok(format!("ws://{rest}/api/chat/ws?ticket={ticket}"));
    }
    if let Some(rest) = base_url.strip_prefix("https://") {
        return Ok(format!("wss://{rest}/api/chat/ws?ticket={ticket}"));
    }

    Err(CliError::InvalidBaseUrl(base_url.to_owned()))
}

fn history_path(counterpart: UserId, after_id: Option<MessageId>, limit: Option<usize>, mark_read: bool) -> String {
    let mut query = Vec::new();
    if let Some(after_id) = after_id {
        query.push(format!("after_id={after_id}"));
    }
    if let Some(limit) = limit {
        query.push(format!("limit={limit}"));
    }
    if mark_read {
        query.push("mark_read=true".to_owned());
    }
    if query.is_empty() {
        format!("/api/chat/history/{counterpart}")
    } else {
        format!("/api/chat/history/{counterpart}?{}", query.join("&"))
    }
}

async fn recv_next(stream: &mut WsStream, timeout: Duration) -> Result<OutboundEvent, CliError> {
    let fut = async {
        loop {
            let Some(message) = stream.next().await else {
                return Err(CliError::WsClosed);
            };
            match message? {
                Message::Text(text) => return events::decode_event(text.as_str()).map_err(CliError::from),
                Message::Close(_) => return Err(CliError::WsClosed),
                _ => {}
            }
        }
    };

    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| CliError::Timeout)?
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
