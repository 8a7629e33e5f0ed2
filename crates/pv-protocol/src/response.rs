//! Decoding of WinRM response envelopes
//!
//! Responses are small and their shape is fixed, so elements are located by
//! local name (namespace prefixes vary between server versions) with a
//! minimal tag scanner instead of a full XML parser.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::ProtocolError;
use crate::session::{CommandId, ShellId};

/// `ERROR_WSMAN_SHELL_NOT_FOUND`
const FAULT_SHELL_NOT_FOUND: u32 = 2_150_858_843;
/// `ERROR_WSMAN_OPERATION_TIMEDOUT`
const FAULT_OPERATION_TIMED_OUT: u32 = 2_150_858_793;

const COMMAND_STATE_DONE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done";

/// A SOAP fault returned by the endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Subcode value, e.g. `w:InvalidSelectors`
    pub subcode: Option<String>,
    /// Numeric WSManFault code, if present
    pub wsman_code: Option<u32>,
    /// Human readable reason
    pub reason: String,
}

impl Fault {
    /// Code used for display: the WSMan code if known, else the subcode
    pub fn code(&self) -> String {
        match (&self.wsman_code, &self.subcode) {
            (Some(code), _) => code.to_string(),
            (None, Some(subcode)) => subcode.clone(),
            (None, None) => "unknown".to_string(),
        }
    }

    /// True if the fault says the shell does not exist (already closed)
    pub fn is_shell_not_found(&self) -> bool {
        self.wsman_code == Some(FAULT_SHELL_NOT_FOUND)
            || self
                .subcode
                .as_deref()
                .is_some_and(|s| local_name(s) == "InvalidSelectors")
    }

    /// True if a long-poll `Receive` simply timed out without output
    pub fn is_timeout(&self) -> bool {
        self.wsman_code == Some(FAULT_OPERATION_TIMED_OUT)
            || self
                .subcode
                .as_deref()
                .is_some_and(|s| local_name(s) == "TimedOut")
    }
}

/// Output collected from one `Receive` response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Decoded stdout bytes
    pub stdout: Vec<u8>,
    /// Decoded stderr bytes
    pub stderr: Vec<u8>,
    /// Whether the command has finished
    pub done: bool,
    /// Exit code, present once `done`
    pub exit_code: Option<i32>,
}

/// Extract a fault from a response body, if it contains one
pub fn parse_fault(xml: &str) -> Option<Fault> {
    let fault = find_elements(xml, "Fault").into_iter().next()?;
    let subcode = find_elements(fault.text, "Subcode")
        .into_iter()
        .next()
        .and_then(|sub| find_elements(sub.text, "Value").into_iter().next())
        .map(|value| unescape(value.text.trim()));
    let wsman = find_elements(fault.text, "WSManFault").into_iter().next();
    let wsman_code = wsman
        .as_ref()
        .and_then(|w| attribute(w.attrs, "Code"))
        .and_then(|code| code.parse().ok());
    let reason = wsman
        .and_then(|w| find_elements(w.text, "Message").into_iter().next())
        .or_else(|| find_elements(fault.text, "Text").into_iter().next())
        .map(|m| unescape(strip_tags(m.text).trim()))
        .unwrap_or_default();

    Some(Fault {
        subcode,
        wsman_code,
        reason,
    })
}

/// Return `Err(Fault)` if the response is a fault
pub fn check_fault(xml: &str) -> Result<(), ProtocolError> {
    match parse_fault(xml) {
        Some(fault) => Err(ProtocolError::Fault(fault)),
        None => Ok(()),
    }
}

/// Parse the `ShellId` from a `Create` response
pub fn parse_shell_id(xml: &str) -> Result<ShellId, ProtocolError> {
    check_fault(xml)?;
    if let Some(element) = find_elements(xml, "ShellId").into_iter().next() {
        return Ok(ShellId::new(unescape(element.text.trim())));
    }
    find_elements(xml, "Selector")
        .into_iter()
        .find(|s| attribute(s.attrs, "Name").as_deref() == Some("ShellId"))
        .map(|s| ShellId::new(unescape(s.text.trim())))
        .ok_or(ProtocolError::MissingElement("ShellId"))
}

/// Parse the `CommandId` from a `Command` response
pub fn parse_command_id(xml: &str) -> Result<CommandId, ProtocolError> {
    check_fault(xml)?;
    find_elements(xml, "CommandId")
        .into_iter()
        .next()
        .map(|e| CommandId(unescape(e.text.trim())))
        .ok_or(ProtocolError::MissingElement("CommandId"))
}

/// Parse streams and command state from a `Receive` response
pub fn parse_receive(xml: &str) -> Result<CommandOutput, ProtocolError> {
    check_fault(xml)?;
    let mut output = CommandOutput::default();

    for stream in find_elements(xml, "Stream") {
        let payload = stream.text.trim();
        if payload.is_empty() {
            continue;
        }
        let bytes = STANDARD.decode(payload)?;
        match attribute(stream.attrs, "Name").as_deref() {
            Some("stdout") => output.stdout.extend_from_slice(&bytes),
            Some("stderr") => output.stderr.extend_from_slice(&bytes),
            _ => {}
        }
    }

    if let Some(state) = find_elements(xml, "CommandState").into_iter().next() {
        output.done = attribute(state.attrs, "State").as_deref() == Some(COMMAND_STATE_DONE);
        if let Some(code) = find_elements(state.text, "ExitCode").into_iter().next() {
            let text = code.text.trim();
            // Exit codes are reported as unsigned 32-bit values
            let value = text
                .parse::<i64>()
                .map_err(|_| ProtocolError::InvalidExitCode(text.to_string()))?;
            output.exit_code = Some(value as i32);
        }
    }

    Ok(output)
}

/// An element located by the scanner
#[derive(Debug, Clone, Copy)]
struct Element<'a> {
    attrs: &'a str,
    text: &'a str,
}

/// Find all elements with the given local name, ignoring namespace prefixes.
///
/// Nested elements with the same local name are not supported; none of the
/// WinRM responses use that shape.
fn find_elements<'a>(xml: &'a str, name: &str) -> Vec<Element<'a>> {
    let mut found = Vec::new();
    let mut rest = xml;
    let mut offset = 0;

    while let Some(start) = rest.find('<') {
        let tag_start = offset + start;
        let after = &xml[tag_start + 1..];
        let Some(tag_len) = after.find('>') else {
            break;
        };
        let tag = &after[..tag_len];
        let advance = tag_start + 1 + tag_len + 1;

        if tag.starts_with('/') || tag.starts_with('?') || tag.starts_with('!') {
            offset = advance;
            rest = &xml[offset..];
            continue;
        }

        let qualified = tag
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or("");
        if local_name(qualified) != name {
            offset = advance;
            rest = &xml[offset..];
            continue;
        }

        let self_closing = tag.ends_with('/');
        let attrs = tag[qualified.len()..].trim_end_matches('/').trim();
        if self_closing {
            found.push(Element { attrs, text: "" });
            offset = advance;
        } else {
            let close = format!("</{}>", qualified);
            match xml[advance..].find(&close) {
                Some(end) => {
                    found.push(Element {
                        attrs,
                        text: &xml[advance..advance + end],
                    });
                    offset = advance + end + close.len();
                }
                None => break,
            }
        }
        rest = &xml[offset..];
    }

    found
}

fn local_name(qualified: &str) -> &str {
    qualified.rsplit(':').next().unwrap_or(qualified)
}

fn attribute(attrs: &str, name: &str) -> Option<String> {
    let mut rest = attrs;
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim();
        let value_part = rest[eq + 1..].trim_start();
        let quote = value_part.chars().next()?;
        if quote != '"' && quote != '\'' {
            return None;
        }
        let end = value_part[1..].find(quote)?;
        let value = &value_part[1..1 + end];
        if local_name(key) == name {
            return Some(unescape(value));
        }
        rest = &value_part[1 + end + 1..];
    }
    None
}

fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
