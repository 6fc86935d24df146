//! JSON-lines import and export of bus messages for offline DLQ handling.

use crate::domain::events::DeadLetter;
use crate::domain::message::BusMessage;
use crate::error::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{BufRead, Write};

/// Reads one dead-letter envelope per line. Lines are kept verbatim as the
/// message payload, even when they do not decode, so the replayer can audit
/// them. Blank lines are skipped.
pub fn read_dead_letters<R: BufRead>(reader: R) -> Result<Vec<BusMessage>> {
    let mut messages = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut message = BusMessage::new(line.as_bytes());
        if let Ok(letter) = DeadLetter::decode(line.as_bytes())
            && !letter.invoice_id.is_empty()
        {
            message = message.with_key(letter.invoice_id);
        }
        messages.push(message);
    }
    Ok(messages)
}

#[derive(Serialize)]
struct MessageLine {
    key: Option<String>,
    headers: BTreeMap<String, String>,
    payload: String,
}

/// Writes each message as a JSON object on its own line.
pub fn write_messages<'a, W: Write>(
    mut sink: W,
    messages: impl IntoIterator<Item = &'a BusMessage>,
) -> Result<()> {
    for message in messages {
        let line = MessageLine {
            key: message
                .key
                .as_deref()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            headers: message
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v).into_owned()))
                .collect(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
        };
        serde_json::to_writer(&mut sink, &line)?;
        sink.write_all(b"\n")?;
    }
    sink.flush()?;
    Ok(())
}
