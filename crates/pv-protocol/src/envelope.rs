//! SOAP envelope construction for WinRM requests
//!
//! Every request shares the same WS-Addressing/WS-Management header and
//! differs only in its action URI, optional `ShellId` selector, option set
//! and body. Stream payloads are base64 encoded as the protocol requires.
//!
//! # Message Flow
//!
//! 1. `Create` opens a shell and returns its `ShellId`
//! 2. `Command` starts a command inside the shell and returns a `CommandId`
//! 3. `Send` / `Receive` move stdin and stdout/stderr until the command is done
//! 4. `Signal` terminates a running command
//! 5. `Delete` closes the shell and every process started inside it

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::session::{CommandId, ShellId};

/// Resource URI of the classic `cmd` shell
pub const SHELL_RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

/// Maximum envelope size advertised to the server
pub const DEFAULT_MAX_ENVELOPE_SIZE: u32 = 153_600;

/// Server-side timeout for a single operation, in seconds.
///
/// `Receive` long-polls up to this long before answering with a
/// `TimedOut` fault, which callers treat as "no output yet".
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u32 = 60;

const NS_SOAP: &str = "http://www.w3.org/2003/05/soap-envelope";
const NS_ADDRESSING: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const NS_WSMAN: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const NS_SHELL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";
const ANONYMOUS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

/// WS-Management action of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Open a shell
    Create,
    /// Close a shell
    Delete,
    /// Start a command
    Command,
    /// Send stdin
    Send,
    /// Poll stdout/stderr and command state
    Receive,
    /// Signal a running command
    Signal,
}

impl Action {
    /// Action URI placed in the `a:Action` header
    pub fn uri(&self) -> &'static str {
        match self {
            Action::Create => "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create",
            Action::Delete => "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete",
            Action::Command => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command",
            Action::Send => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Send",
            Action::Receive => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive",
            Action::Signal => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal",
        }
    }
}

/// Builds request envelopes addressed to one WinRM endpoint
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Endpoint URL, e.g. `http://10.0.0.5:5985/wsman`
    endpoint: String,
    max_envelope_size: u32,
    operation_timeout_secs: u32,
}

impl Envelope {
    /// Create a builder for the given endpoint URL
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            max_envelope_size: DEFAULT_MAX_ENVELOPE_SIZE,
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT_SECS,
        }
    }

    /// Override the server-side operation timeout
    pub fn with_operation_timeout(mut self, secs: u32) -> Self {
        self.operation_timeout_secs = secs;
        self
    }

    /// Endpoint URL this builder addresses
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Open a shell with stdin and stdout/stderr streams
    pub fn create_shell(&self) -> String {
        let body = "<rsp:Shell>\
            <rsp:InputStreams>stdin</rsp:InputStreams>\
            <rsp:OutputStreams>stdout stderr</rsp:OutputStreams>\
            </rsp:Shell>";
        self.render(
            Action::Create,
            None,
            &[("WINRS_NOPROFILE", "FALSE"), ("WINRS_CODEPAGE", "65001")],
            body,
        )
    }

    /// Close a shell
    pub fn delete_shell(&self, shell: &ShellId) -> String {
        self.render(Action::Delete, Some(shell), &[], "")
    }

    /// Start `command` inside `shell`
    pub fn execute(&self, shell: &ShellId, command: &str) -> String {
        let body = format!(
            "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
            escape(command)
        );
        self.render(
            Action::Command,
            Some(shell),
            &[
                ("WINRS_CONSOLEMODE_STDIN", "TRUE"),
                ("WINRS_SKIP_CMD_SHELL", "FALSE"),
            ],
            &body,
        )
    }

    /// Send a chunk of stdin; `end` marks end of input
    pub fn send_input(&self, shell: &ShellId, command: &CommandId, data: &[u8], end: bool) -> String {
        let end_attr = if end { " End=\"true\"" } else { "" };
        let body = format!(
            "<rsp:Send><rsp:Stream Name=\"stdin\" CommandId=\"{}\"{}>{}</rsp:Stream></rsp:Send>",
            escape(command.as_str()),
            end_attr,
            STANDARD.encode(data)
        );
        self.render(Action::Send, Some(shell), &[], &body)
    }

    /// Poll stdout/stderr of a command
    pub fn receive(&self, shell: &ShellId, command: &CommandId) -> String {
        let body = format!(
            "<rsp:Receive><rsp:DesiredStream CommandId=\"{}\">stdout stderr</rsp:DesiredStream></rsp:Receive>",
            escape(command.as_str())
        );
        self.render(
            Action::Receive,
            Some(shell),
            &[("WSMAN_CMDSHELL_OPTION_KEEPALIVE", "TRUE")],
            &body,
        )
    }

    /// Terminate a running command
    pub fn signal_terminate(&self, shell: &ShellId, command: &CommandId) -> String {
        let body = format!(
            "<rsp:Signal CommandId=\"{}\"><rsp:Code>{}</rsp:Code></rsp:Signal>",
            escape(command.as_str()),
            SIGNAL_TERMINATE
        );
        self.render(Action::Signal, Some(shell), &[], &body)
    }

    fn render(
        &self,
        action: Action,
        shell: Option<&ShellId>,
        options: &[(&str, &str)],
        body: &str,
    ) -> String {
        let mut xml = String::with_capacity(1536 + body.len());
        xml.push_str(&format!(
            "<s:Envelope xmlns:s=\"{NS_SOAP}\" xmlns:a=\"{NS_ADDRESSING}\" xmlns:w=\"{NS_WSMAN}\" xmlns:rsp=\"{NS_SHELL}\">"
        ));
        xml.push_str("<s:Header>");
        xml.push_str(&format!("<a:To>{}</a:To>", escape(&self.endpoint)));
        xml.push_str(&format!(
            "<a:ReplyTo><a:Address s:mustUnderstand=\"true\">{ANONYMOUS}</a:Address></a:ReplyTo>"
        ));
        xml.push_str(&format!(
            "<w:MaxEnvelopeSize s:mustUnderstand=\"true\">{}</w:MaxEnvelopeSize>",
            self.max_envelope_size
        ));
        xml.push_str(&format!(
            "<a:MessageID>uuid:{}</a:MessageID>",
            uuid::Uuid::new_v4().to_string().to_uppercase()
        ));
        xml.push_str("<w:Locale xml:lang=\"en-US\" s:mustUnderstand=\"false\"/>");
        xml.push_str(&format!(
            "<w:OperationTimeout>PT{}S</w:OperationTimeout>",
            self.operation_timeout_secs
        ));
        xml.push_str(&format!(
            "<w:ResourceURI s:mustUnderstand=\"true\">{SHELL_RESOURCE_URI}</w:ResourceURI>"
        ));
        xml.push_str(&format!(
            "<a:Action s:mustUnderstand=\"true\">{}</a:Action>",
            action.uri()
        ));
        if let Some(shell) = shell {
            xml.push_str(&format!(
                "<w:SelectorSet><w:Selector Name=\"ShellId\">{}</w:Selector></w:SelectorSet>",
                escape(shell.as_str())
            ));
        }
        if !options.is_empty() {
            xml.push_str("<w:OptionSet>");
            for (name, value) in options {
                xml.push_str(&format!("<w:Option Name=\"{name}\">{value}</w:Option>"));
            }
            xml.push_str("</w:OptionSet>");
        }
        xml.push_str("</s:Header><s:Body>");
        xml.push_str(body);
        xml.push_str("</s:Body></s:Envelope>");
        xml
    }
}

/// Escape text for use in XML content or attribute values
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope::new("http://10.0.0.5:5985/wsman")
    }

    #[test]
    fn test_create_shell_has_action_and_no_selector() {
        let xml = envelope().create_shell();
        assert!(xml.contains(Action::Create.uri()));
        assert!(xml.contains("<rsp:OutputStreams>stdout stderr</rsp:OutputStreams>"));
        assert!(!xml.contains("SelectorSet"));
        assert!(xml.contains("<a:To>http://10.0.0.5:5985/wsman</a:To>"));
    }

    #[test]
    fn test_execute_escapes_command() {
        let xml = envelope().execute(&ShellId::from("S1"), "echo a && type \"x<y\"");
        assert!(xml.contains("<w:Selector Name=\"ShellId\">S1</w:Selector>"));
        assert!(xml.contains("echo a &amp;&amp; type &quot;x&lt;y&quot;"));
    }

    #[test]
    fn test_send_input_encodes_payload() {
        let command = CommandId("C1".to_string());
        let xml = envelope().send_input(&ShellId::from("S1"), &command, b"dir\r\n", true);
        assert!(xml.contains("CommandId=\"C1\" End=\"true\">ZGlyDQo=</rsp:Stream>"));
    }

    #[test]
    fn test_message_ids_are_unique() {
        let env = envelope();
        let a = env.delete_shell(&ShellId::from("S1"));
        let b = env.delete_shell(&ShellId::from("S1"));
        assert_ne!(a, b);
    }
}
