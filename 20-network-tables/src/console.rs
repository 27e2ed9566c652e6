//! Line-oriented console over a session's entry table.
//!
//! Both CLI modes run it on stdin. Commands are case-insensitive and have
//! one-letter aliases:
//!
//! - `PUT <key> <value>` (`p`): write an entry, the value is the rest of the line
//! - `GET <key>` (`g`): print one value
//! - `LIST` (`l`): print every entry as a JSON line
//! - `HELP` (`h`)
//! - `EXIT` (`e`)
//!
//! Every change to the table, local or remote, is echoed as `* <key> = <value>`.

use std::{future::Future, sync::Arc};

use anyhow::{Result, anyhow};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    select,
    sync::mpsc,
};

use crate::{table::EntryTable, value::Value};

const HELP: &str = "\
Commands (case-insensitive):
  PUT <key> <value>  (alias: p)  -- write an entry
  GET <key>          (alias: g)  -- print one value
  LIST               (alias: l)  -- print every entry as JSON
  HELP               (alias: h)  -- show this message
  EXIT               (alias: e)  -- leave the console
Values: true/false, numbers, [a, b, ...] arrays, \"quoted\" or bare strings.";

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Put { key: String, value: Value },
    Get { key: String },
    List,
    Help,
    Exit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("empty command"));
        }

        let mut parts = trimmed.splitn(3, char::is_whitespace);
        let cmd = parts.next().unwrap_or_default().to_uppercase();
        let normalized_cmd = match cmd.as_str() {
            "P" => "PUT",
            "G" => "GET",
            "L" => "LIST",
            "H" => "HELP",
            "E" => "EXIT",
            other => other,
        };
        let key = parts.next().map(str::trim).filter(|key| !key.is_empty());
        let rest = parts.next().map(str::trim).filter(|rest| !rest.is_empty());

        match (normalized_cmd, key, rest) {
            ("EXIT", None, None) => Ok(ConsoleCommand::Exit),
            ("HELP", None, None) => Ok(ConsoleCommand::Help),
            ("LIST", None, None) => Ok(ConsoleCommand::List),
            ("GET", Some(key), None) => Ok(ConsoleCommand::Get {
                key: key.to_string(),
            }),
            ("PUT", Some(key), Some(value)) => Ok(ConsoleCommand::Put {
                key: key.to_string(),
                value: parse_value(value),
            }),
            ("GET", _, _) => Err(anyhow!("GET requires exactly one argument: GET <key>")),
            ("PUT", _, _) => Err(anyhow!("PUT requires a key and a value: PUT <key> <value>")),
            ("EXIT" | "HELP" | "LIST", _, _) => Err(anyhow!("{normalized_cmd} takes no arguments")),
            _ => Err(anyhow!(
                "invalid command. Try: PUT/p <key> <value>, GET/g <key>, LIST/l, HELP/h, EXIT/e"
            )),
        }
    }
}

/// Reads a console value.
///
/// `[...]` is an array whose element type is taken from its elements: all
/// booleans, all numbers, or else strings. `[]` is an empty string array.
pub fn parse_value(text: &str) -> Value {
    let text = text.trim();
    if let Some(inner) = text.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
        let items: Vec<&str> = inner
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .collect();
        if items.is_empty() {
            return Value::StringArray(Vec::new());
        }
        if let Some(flags) = items.iter().map(|item| parse_bool(item)).collect::<Option<Vec<_>>>() {
            return Value::BooleanArray(flags);
        }
        if let Some(numbers) = items.iter().map(|item| parse_number(item)).collect::<Option<Vec<_>>>() {
            return Value::DoubleArray(numbers);
        }
        return Value::StringArray(items.into_iter().map(unquote).collect());
    }

    if let Some(flag) = parse_bool(text) {
        Value::Boolean(flag)
    } else if let Some(number) = parse_number(text) {
        Value::Double(number)
    } else {
        Value::String(unquote(text))
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    if text.eq_ignore_ascii_case("true") {
        Some(true)
    } else if text.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

fn parse_number(text: &str) -> Option<f64> {
    text.parse::<f64>().ok().filter(|number| number.is_finite())
}

fn unquote(text: &str) -> String {
    text.strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(text)
        .to_string()
}

/// Runs one command and returns the lines to print, or `None` for `EXIT`.
pub fn execute(table: &EntryTable, command: ConsoleCommand) -> Option<Vec<String>> {
    let lines = match command {
        ConsoleCommand::Put { key, value } => match table.put(&key, value) {
            Ok(()) => vec!["OK".to_string()],
            Err(err) => vec![format!("ERROR: {err}")],
        },
        ConsoleCommand::Get { key } => match table.get_value(&key) {
            Some(value) => vec![format!("{key} = {value}")],
            None => vec![format!("{key} not found")],
        },
        ConsoleCommand::List => table
            .entries()
            .iter()
            .map(|entry| {
                serde_json::to_string(entry).unwrap_or_else(|err| format!("ERROR: {err}"))
            })
            .collect(),
        ConsoleCommand::Help => HELP.lines().map(str::to_string).collect(),
        ConsoleCommand::Exit => return None,
    };
    Some(lines)
}

/// Reads commands from `input` until `EXIT`, end of input, or `stop`.
pub async fn run<R, W, F>(table: Arc<EntryTable>, input: R, mut output: W, stop: F) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let listener = table.add_listener(move |event| {
        // The receiver only goes away when the console is done.
        let _ = events_tx.send(format!("* {} = {}", event.name, event.value));
    });

    let mut lines = input.lines();
    tokio::pin!(stop);

    let result = async {
        loop {
            let reply = select! {
                biased;
                _ = &mut stop => break,
                Some(event) = events.recv() => vec![event],
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match ConsoleCommand::parse(&line) {
                        Ok(command) => match execute(&table, command) {
                            Some(reply) => reply,
                            None => {
                                write_line(&mut output, "bye").await?;
                                break;
                            }
                        },
                        Err(err) => vec![format!("ERROR: {err}")],
                    }
                }
            };
            for line in reply {
                write_line(&mut output, &line).await?;
            }
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    table.remove_listener(listener);
    result
}

async fn write_line<W>(output: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}
