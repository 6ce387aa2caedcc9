use log::{ error, warn };
use std::error::Error;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{ AsyncBufReadExt, BufReader };
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::attachment::Attachment;
use crate::chat::{ ChatChange, ChatState };
use crate::models::voucher::{ Voucher, VoucherFilters, VoucherPatch, VoucherStatus };
use crate::session::{ DraftField, Session, ValidationOutcome };

const HELP: &str = "\
Commands:
  /vouchers [limit]        list vouchers (filtered by the current search)
  /search <text>           filter by payer, payee, bank or reference
  /select <id>             select a voucher and open its conversation
  /show <id>               fetch one voucher from the server
  /status <id> <STATUS>    change a voucher status (PENDING, ANALYZED, CORRECTED, REJECTED)
  /insights                show spending insights
  /attach <path>           extract a receipt for review
  /edit <field> <value>    edit the draft (payer, payee, amount, currency, date, description, ref, bank)
  /confirm                 save the reviewed draft
  /cancel                  discard the draft
  /history                 print the current conversation
  /quit                    exit
Anything else is sent to the assistant.";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Say(String),
    Vouchers(Option<u32>),
    Search(String),
    Select(String),
    Show(String),
    Status(String, VoucherStatus),
    Insights,
    Attach(String),
    Edit(DraftField, String),
    Confirm,
    Cancel,
    History,
    Help,
    Quit,
}

impl Command {
    /// `Ok(None)` for blank lines.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        if !line.starts_with('/') {
            return Ok(Some(Command::Say(line.to_string())));
        }

        let (name, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let command = match name {
            "/vouchers" => {
                let limit = if rest.is_empty() {
                    None
                } else {
                    Some(rest.parse::<u32>().map_err(|_| format!("Invalid limit: '{}'", rest))?)
                };
                Command::Vouchers(limit)
            }
            "/search" => Command::Search(rest.to_string()),
            "/select" => Command::Select(required(rest, "/select <id>")?),
            "/show" => Command::Show(required(rest, "/show <id>")?),
            "/status" => {
                let (id, status) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| "Usage: /status <id> <STATUS>".to_string())?;
                let status = status
                    .trim()
                    .parse::<VoucherStatus>()
                    .map_err(|e| e.to_string())?;
                Command::Status(id.to_string(), status)
            }
            "/insights" => Command::Insights,
            "/attach" => Command::Attach(required(rest, "/attach <path>")?),
            "/edit" => {
                let (field, value) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| "Usage: /edit <field> <value>".to_string())?;
                Command::Edit(
                    field.parse::<DraftField>().map_err(|e| e.to_string())?,
                    value.trim().to_string()
                )
            }
            "/confirm" => Command::Confirm,
            "/cancel" => Command::Cancel,
            "/history" => Command::History,
            "/help" => Command::Help,
            "/quit" | "/exit" => Command::Quit,
            other => {
                return Err(format!("Unknown command: {} (try /help)", other));
            }
        };
        Ok(Some(command))
    }
}

fn required(value: &str, usage: &str) -> Result<String, String> {
    if value.is_empty() { Err(format!("Usage: {}", usage)) } else { Ok(value.to_string()) }
}

fn voucher_line(v: &Voucher) -> String {
    format!(
        "{}  {:<10} {:<20} -> {:<20} {} {:>10.2}  {}",
        v.id,
        v.status.label(),
        v.payer,
        v.payee,
        v.currency,
        v.amount,
        v.bank_name.as_deref().unwrap_or("-")
    )
}

/// Prints streamed replies as they arrive.
fn spawn_renderer(chat: &Arc<ChatState>) -> JoinHandle<()> {
    let mut changes = chat.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(ChatChange::Chunk { chunk, .. }) => {
                    print!("{}", chunk);
                    let _ = std::io::stdout().flush();
                }
                Ok(ChatChange::Finalized { .. }) => println!(),
                Ok(ChatChange::Failed { message, .. }) => {
                    println!("\n{}", crate::chat::error_text(&message));
                }
                Ok(ChatChange::HistoryLoaded { conversation_id, count }) => {
                    println!("[conversation {} loaded, {} messages]", conversation_id, count);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Renderer skipped {} updates", skipped),
                Err(RecvError::Closed) => {
                    break;
                }
            }
        }
    })
}

/// Runs one command. Returns false when the user asked to quit.
async fn execute(
    session: &Session,
    command: Command,
    default_limit: u32
) -> Result<bool, Box<dyn Error + Send + Sync>> {
    let vault = session.vault();
    match command {
        Command::Say(text) => session.send_text(&text).await?,
        Command::Vouchers(limit) => {
            vault.load_vouchers(&VoucherFilters::limit(limit.unwrap_or(default_limit))).await?;
            for v in vault.filtered().await {
                println!("{}", voucher_line(&v));
            }
        }
        Command::Search(query) => {
            vault.set_search_query(&query).await;
            for v in vault.filtered().await {
                println!("{}", voucher_line(&v));
            }
        }
        Command::Select(id) => {
            match session.select_voucher(&id).await {
                Some(v) => println!("Selected {}", voucher_line(&v)),
                None => println!("Voucher {} is not loaded; try /vouchers or /show {}", id, id),
            }
        }
        Command::Show(id) => {
            let v = vault.refresh_voucher(&id).await?;
            println!("{}", serde_json::to_string_pretty(&v)?);
        }
        Command::Status(id, status) => {
            let v = vault.patch_voucher(&id, &VoucherPatch::status(status)).await?;
            println!("Updated {}", voucher_line(&v));
        }
        Command::Insights => {
            vault.load_insights().await;
            match vault.insights().await {
                Some(insights) => println!("{}", serde_json::to_string_pretty(&insights)?),
                None => println!("No insights available"),
            }
        }
        Command::Attach(path) => {
            let file = Attachment::from_path(&path).await?;
            match session.start_validation(file).await? {
                ValidationOutcome::Draft => {
                    if let Some(draft) = session.draft().await {
                        println!("{}", serde_json::to_string_pretty(&draft.data)?);
                        println!("Review with /edit, then /confirm or /cancel");
                    }
                }
                ValidationOutcome::Streamed => println!("Extraction unavailable; asking the assistant instead"),
            }
        }
        Command::Edit(field, value) => {
            if !session.update_draft(field, &value).await {
                println!("No draft open; use /attach first");
            }
        }
        Command::Confirm => {
            if session.draft().await.is_none() {
                println!("Nothing to confirm");
                return Ok(true);
            }
            if let Some(v) = session.confirm_draft().await? {
                println!("Saved {}", voucher_line(&v));
            }
            if let Some(last) = session.chat().messages().await.last() {
                println!("{}", last.content);
            }
        }
        Command::Cancel => session.cancel_validation().await,
        Command::History => {
            for m in session.chat().messages().await {
                println!("[{}] {}: {}", m.timestamp.format("%Y-%m-%d %H:%M"), m.role, m.content);
            }
        }
        Command::Help => println!("{}", HELP),
        Command::Quit => {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Reads commands from stdin until `/quit` or end of input.
pub async fn run(session: &Session, default_limit: u32) -> Result<(), Box<dyn Error + Send + Sync>> {
    let renderer = spawn_renderer(session.chat());
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => {
                continue;
            }
            Err(usage) => {
                println!("{}", usage);
                continue;
            }
        };
        match execute(session, command, default_limit).await {
            Ok(true) => {}
            Ok(false) => {
                break;
            }
            Err(e) => {
                error!("{}", e);
            }
        }
    }

    renderer.abort();
    Ok(())
}
