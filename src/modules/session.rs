//! Named snapshots of every module's selections

use anyhow::{bail, Result};
use clap::Subcommand;
use fuku_core::{Client, Module};
use serde_json::Value;

use crate::workspace::Workspace;

pub struct SessionModule;

impl Module for SessionModule {
    fn name(&self) -> &'static str {
        "session"
    }

    /// Snapshots are not themselves part of a snapshot
    fn persisted_keys(&self) -> &'static [&'static str] {
        &[]
    }
}

#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    /// Save the current selections
    Sv { name: String },
    /// Restore saved selections
    Ld { name: String },
    /// List saved sessions
    Ls,
    /// Show the current selections
    Sh,
    /// Delete a saved session
    Rm { name: String },
}

pub async fn run(ws: &mut Workspace, cmd: SessionCommand) -> Result<()> {
    let client = ws.client_mut();
    match cmd {
        SessionCommand::Sv { name } => save(client, &name),
        SessionCommand::Ld { name } => load(client, &name)?,
        SessionCommand::Ls => {
            for name in list(client) {
                println!("{}", name);
            }
        }
        SessionCommand::Sh => print!("{}", show(client)?),
        SessionCommand::Rm { name } => remove(client, &name)?,
    }
    Ok(())
}

pub fn save(client: &mut Client, name: &str) {
    let snapshot = Value::Object(client.snapshot());
    // Session names are single keys, never dotted paths
    client.store_mut().module_mut("session").insert(name.to_string(), snapshot);
}

pub fn remove(client: &mut Client, name: &str) -> Result<()> {
    match client.store_mut().module_mut("session").remove(name) {
        Some(_) => Ok(()),
        None => bail!("no session \"{}\"", name),
    }
}

pub fn load(client: &mut Client, name: &str) -> Result<()> {
    let snapshot = client
        .store()
        .module("session")
        .and_then(|sessions| sessions.get(name))
        .and_then(Value::as_object)
        .cloned();
    match snapshot {
        Some(snapshot) => {
            client.restore(&snapshot);
            Ok(())
        }
        None => bail!("no session \"{}\"", name),
    }
}

pub fn list(client: &Client) -> Vec<String> {
    client
        .store()
        .module("session")
        .map(|sessions| sessions.keys().cloned().collect())
        .unwrap_or_default()
}

/// Current persisted state, one block per module that has any.
pub fn show(client: &Client) -> Result<String> {
    let mut out = String::new();
    for (module, state) in client.snapshot() {
        let pretty = serde_json::to_string_pretty(&state)?;
        out.push_str(&format!("{}:\n", module));
        for line in pretty.lines() {
            out.push_str(&format!("  {}\n", line));
        }
    }
    Ok(out)
}
