use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use dmsgprims_frame::header::{command_name, flags_name};
use dmsgprims_frame::Message;
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Owned snapshot of a delivered frame, detached from the message pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRecord {
    pub msgid: u64,
    pub circuit: u64,
    pub cmd: u32,
    pub error: u32,
    pub aux: Vec<u8>,
}

impl FrameRecord {
    pub fn of(msg: &Message) -> Self {
        Self {
            msgid: msg.msgid(),
            circuit: msg.circuit(),
            cmd: msg.cmd(),
            error: msg.error(),
            aux: msg.aux().to_vec(),
        }
    }
}

#[derive(Serialize)]
struct FrameOutput<'a> {
    kind: &'static str,
    peer: &'a str,
    msgid: u64,
    circuit: u64,
    command: &'static str,
    flags: String,
    error: u32,
    aux_size: usize,
    aux: String,
    timestamp: String,
}

pub fn print_frame(record: &FrameRecord, peer: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = FrameOutput {
                kind: "frame-received",
                peer,
                msgid: record.msgid,
                circuit: record.circuit,
                command: command_name(record.cmd),
                flags: flags_name(record.cmd),
                error: record.error,
                aux_size: record.aux.len(),
                aux: aux_preview(&record.aux),
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["MSGID", "CIRCUIT", "COMMAND", "FLAGS", "ERROR", "PEER", "AUX"])
                .add_row(vec![
                    record.msgid.to_string(),
                    record.circuit.to_string(),
                    command_name(record.cmd).to_string(),
                    flags_name(record.cmd),
                    record.error.to_string(),
                    peer.to_string(),
                    aux_preview(&record.aux),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "msgid={} circuit={} cmd={} flags={} error={} size={} peer={} aux={}",
                record.msgid,
                record.circuit,
                command_name(record.cmd),
                flags_name(record.cmd),
                record.error,
                record.aux.len(),
                peer,
                aux_preview(&record.aux)
            );
        }
        OutputFormat::Raw => {
            print_raw(&record.aux);
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn aux_preview(aux: &[u8]) -> String {
    match std::str::from_utf8(aux) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", aux.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
