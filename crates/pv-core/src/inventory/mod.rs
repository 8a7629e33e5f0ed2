//! Host inventory model
//!
//! An inventory is an ordered list of [`HostEntry`] values. The same line
//! grammar is used for inventory files (under `[group]` headers) and for the
//! snapshot published on the controller record:
//!
//! ```text
//! web1 ansible_host=10.0.0.5 ansible_user=deploy ansible_ssh_private_key_file=/keys/id_rsa
//! win1 ansible_connection=winrm ansible_user=admin ansible_ssh_pass=secret
//! ```

mod file;

pub use file::load_from_inventory_file;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

/// Inventory variable for the host address
pub const VAR_HOST: &str = "ansible_host";
/// Inventory variable for the remote user
pub const VAR_USER: &str = "ansible_user";
/// Inventory variable for the remote port
pub const VAR_PORT: &str = "ansible_port";
/// Inventory variable for the SSH private key file
pub const VAR_PRIVATE_KEY: &str = "ansible_ssh_private_key_file";
/// Inventory variable for the connection kind
pub const VAR_CONNECTION: &str = "ansible_connection";
/// Inventory variable for the password
pub const VAR_PASSWORD: &str = "ansible_ssh_pass";
/// Inventory variable overriding the supervised command
pub const VAR_RUN_COMMAND: &str = "app_run_command";

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Default WinRM HTTP port
pub const DEFAULT_WINRM_PORT: u16 = 5985;

/// Remote execution transport of a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Transport {
    /// Key-authenticated streaming command execution
    #[default]
    Ssh,
    /// Password-authenticated session-handle protocol over HTTP
    WinRm,
}

impl Transport {
    /// Parse an `ansible_connection` value
    pub fn from_connection(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "winrm" => Some(Transport::WinRm),
            "ssh" | "smart" | "paramiko" => Some(Transport::Ssh),
            _ => None,
        }
    }

    /// Value written back to the inventory
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Ssh => "ssh",
            Transport::WinRm => "winrm",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One host of the inventory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    /// Unique name within the inventory
    pub name: String,
    /// Address to connect to; defaults to `name`
    pub host: String,
    /// Explicit port, if any
    pub port: Option<u16>,
    /// Remote user
    pub user: String,
    /// Path of the SSH private key
    pub private_key: Option<String>,
    /// WinRM password
    pub password: Option<String>,
    /// Transport used to reach the host
    pub transport: Transport,
    /// Command overriding the globally configured one
    pub run_command: Option<String>,
}

impl HostEntry {
    /// Create an entry whose address is its name
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            host: name.clone(),
            name,
            ..Default::default()
        }
    }

    /// The credential matching this entry's transport
    pub fn auth_secret(&self) -> Option<&str> {
        match self.transport {
            Transport::Ssh => self.private_key.as_deref(),
            Transport::WinRm => self.password.as_deref(),
        }
    }

    /// Check the fields required before the host can be claimed
    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err(format!("Could not find host name for entry {}", self.name));
        }
        if self.user.trim().is_empty() {
            return Err(format!("Could not find user for entry {}", self.name));
        }
        Ok(())
    }
}

/// Parse one inventory line. Returns `None` for blank lines.
pub fn parse_entry(line: &str) -> Option<HostEntry> {
    let mut tokens = tokenize(line).into_iter();
    let name = tokens.next()?;
    let mut entry = HostEntry {
        name,
        ..Default::default()
    };

    for token in tokens {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        match key {
            VAR_HOST | "ansible_ssh_host" => entry.host = value.to_string(),
            VAR_USER | "ansible_ssh_user" => entry.user = value.to_string(),
            VAR_PORT | "ansible_ssh_port" => match value.parse() {
                Ok(port) => entry.port = Some(port),
                Err(_) => tracing::warn!(
                    "Ignoring invalid port `{}` for inventory host {}",
                    value,
                    entry.name
                ),
            },
            VAR_PRIVATE_KEY => entry.private_key = Some(value.to_string()),
            VAR_PASSWORD | "ansible_password" => entry.password = Some(value.to_string()),
            VAR_RUN_COMMAND => entry.run_command = Some(value.to_string()),
            VAR_CONNECTION => match Transport::from_connection(value) {
                Some(transport) => entry.transport = transport,
                None => tracing::warn!(
                    "Unsupported connection `{}` for inventory host {}, using ssh",
                    value,
                    entry.name
                ),
            },
            _ => {}
        }
    }

    if entry.host.is_empty() {
        entry.host = entry.name.clone();
    }
    Some(entry)
}

/// Parse snapshot text: one host per line, blank and `#` lines skipped.
///
/// Later entries reusing a name are dropped.
pub fn parse_snapshot(text: &str) -> Vec<HostEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if is_host_line(line) {
            push_unique(&mut entries, parse_entry(line));
        }
    }
    entries
}

/// Serialize entries back to snapshot text.
///
/// Attributes are written in a fixed order so that successive snapshots
/// diff cleanly.
pub fn serialize(entries: &[HostEntry]) -> String {
    let mut text = String::new();
    for entry in entries {
        text.push_str(&entry.name);
        if !entry.host.is_empty() {
            write_attr(&mut text, VAR_HOST, &entry.host);
        }
        if let Some(key) = entry.private_key.as_deref().filter(|v| !v.is_empty()) {
            write_attr(&mut text, VAR_PRIVATE_KEY, key);
        }
        if let Some(password) = entry.password.as_deref().filter(|v| !v.is_empty()) {
            write_attr(&mut text, VAR_PASSWORD, password);
        }
        if let Some(command) = entry.run_command.as_deref().filter(|v| !v.is_empty()) {
            write_attr(&mut text, VAR_RUN_COMMAND, command);
        }
        if let Some(port) = entry.port {
            write_attr(&mut text, VAR_PORT, &port.to_string());
        }
        if !entry.user.is_empty() {
            write_attr(&mut text, VAR_USER, &entry.user);
        }
        if entry.transport != Transport::default() {
            write_attr(&mut text, VAR_CONNECTION, entry.transport.as_str());
        }
        text.push('\n');
    }
    text
}

/// Find the entry called `name`
pub fn find_by_name<'a>(entries: &'a [HostEntry], name: &str) -> Option<&'a HostEntry> {
    entries.iter().find(|entry| entry.name == name)
}

pub(crate) fn is_host_line(line: &str) -> bool {
    !line.is_empty() && !line.starts_with('#')
}

pub(crate) fn push_unique(entries: &mut Vec<HostEntry>, entry: Option<HostEntry>) {
    let Some(entry) = entry else {
        return;
    };
    if entries.iter().any(|e| e.name == entry.name) {
        tracing::warn!("Ignoring duplicate inventory host {}", entry.name);
        return;
    }
    entries.push(entry);
}

fn write_attr(text: &mut String, key: &str, value: &str) {
    text.push(' ');
    text.push_str(key);
    text.push('=');
    if needs_quoting(value) {
        text.push('"');
        for c in value.chars() {
            if c == '"' || c == '\\' {
                text.push('\\');
            }
            text.push(c);
        }
        text.push('"');
    } else {
        text.push_str(value);
    }
}

fn needs_quoting(value: &str) -> bool {
    value
        .chars()
        .any(|c| c.is_whitespace() || c == '"' || c == '\'')
}

/// Split on whitespace. A quote opens a quoted section only as the first
/// character of a token or of the value after its first `=`; anywhere else
/// it is kept literally.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut token = String::new();
        let mut value_start = true;
        let mut seen_eq = false;
        while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
            if value_start && (c == '"' || c == '\'') {
                read_quoted(&mut chars, c, &mut token);
                value_start = false;
                continue;
            }
            token.push(c);
            value_start = c == '=' && !seen_eq;
            seen_eq |= c == '=';
        }
        tokens.push(token);
    }
    tokens
}

/// Read up to the closing `quote`. Inside, a backslash escapes the quote
/// character or another backslash; an unterminated section runs to the end.
fn read_quoted(chars: &mut Peekable<Chars<'_>>, quote: char, out: &mut String) {
    while let Some(c) = chars.next() {
        if c == quote {
            return;
        }
        if c == '\\' {
            if let Some(escaped) = chars.next_if(|&n| n == quote || n == '\\') {
                out.push(escaped);
                continue;
            }
        }
        out.push(c);
    }
}
