use crate::message::Message;
use crate::route::RouteTable;

/// Per-session limits and identity, cloned from the server settings for
/// every accepted connection.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub hostname: String,
    pub max_message_size: usize,
    pub max_errors: usize,
}

/// Protocol stage within one SMTP transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Banner sent, no HELO/EHLO yet.
    Connected,
    /// Greeting exchanged, no open transaction.
    Greeted,
    /// MAIL FROM accepted.
    MailFrom,
    /// At least one RCPT TO accepted.
    RcptTo,
    /// Between the 354 reply and the end-of-data marker.
    Data,
}

/// What the connection handler must do after feeding one command line.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    /// Send the reply and keep reading commands.
    Reply(String),
    /// Send the reply and close the connection.
    Close(String),
    /// Send the reply, then perform the TLS handshake and restart the
    /// dialogue on the secured stream.
    StartTls(String),
    /// Send the 354 reply and switch to reading data lines.
    BeginData(String),
}

#[derive(Debug, PartialEq, Eq)]
pub enum DataOutcome {
    /// Keep reading data lines.
    More,
    /// End-of-data marker seen; deliver and reply with the aggregate
    /// outcome.
    Complete(Message),
    /// End-of-data marker seen but the body exceeded the maximum size.
    /// Reply 552; the session itself continues.
    TooLarge,
}

/// The per-connection SMTP state machine.
///
/// Consumes one line at a time and returns the reply plus a control
/// action; it never touches the socket itself, so transitions are
/// testable without any I/O. Invalid or out-of-order commands are
/// rejected without a state change until the consecutive-error threshold
/// forces the session to be aborted.
pub struct SmtpSession {
    config: SessionConfig,
    stage: Stage,
    tls_active: bool,
    starttls_available: bool,
    helo: Option<String>,
    sender: Option<String>,
    recipients: Vec<String>,
    body: Vec<u8>,
    body_overflow: bool,
    errors: usize,
}

impl SmtpSession {
    pub fn new(config: SessionConfig, tls_active: bool, starttls_available: bool) -> Self {
        Self {
            config,
            stage: Stage::Connected,
            tls_active,
            starttls_available,
            helo: None,
            sender: None,
            recipients: Vec::new(),
            body: Vec::new(),
            body_overflow: false,
            errors: 0,
        }
    }

    pub fn greeting(&self) -> String {
        format!("220 {} ESMTP kutsche\r\n", self.config.hostname)
    }

    pub fn in_data(&self) -> bool {
        self.stage == Stage::Data
    }

    /// The client name from the last HELO/EHLO, for logging.
    pub fn helo(&self) -> Option<&str> {
        self.helo.as_deref()
    }

    pub fn handle_command(&mut self, line: &str, routes: &RouteTable) -> Action {
        debug_assert!(!self.in_data(), "data lines must go to handle_data_line");
        let line = line.trim();
        let (verb, args) = match line.split_once(char::is_whitespace) {
            Some((verb, args)) => (verb, args.trim()),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => self.cmd_helo(args, false),
            "EHLO" => self.cmd_helo(args, true),
            "STARTTLS" => self.cmd_starttls(args),
            "MAIL" => self.cmd_mail(args),
            "RCPT" => self.cmd_rcpt(args, routes),
            "DATA" => self.cmd_data(args),
            "RSET" => {
                self.reset_envelope();
                if self.stage != Stage::Connected {
                    self.stage = Stage::Greeted;
                }
                self.accept("250 2.0.0 OK\r\n")
            }
            "NOOP" => self.accept("250 2.0.0 OK\r\n"),
            "QUIT" => Action::Close("221 2.0.0 Bye\r\n".to_string()),
            "VRFY" | "EXPN" => self.accept("252 2.5.1 Cannot verify user\r\n"),
            "HELP" => self.accept("214 2.0.0 See RFC 5321\r\n"),
            "AUTH" => self.reject("502 5.5.1 Authentication not supported\r\n"),
            "" => self.reject("500 5.5.2 Empty command\r\n"),
            _ => self.reject("500 5.5.1 Command not recognized\r\n"),
        }
    }

    /// Consumes one raw data line (terminator included) after DATA.
    pub fn handle_data_line(&mut self, raw: &[u8]) -> DataOutcome {
        debug_assert!(self.in_data(), "not in the data phase");
        let mut end = raw.len();
        if end > 0 && raw[end - 1] == b'\n' {
            end -= 1;
            if end > 0 && raw[end - 1] == b'\r' {
                end -= 1;
            }
        }
        let line = &raw[..end];

        if line == b"." {
            self.stage = Stage::Greeted;
            if self.body_overflow {
                self.reset_envelope();
                return DataOutcome::TooLarge;
            }
            let message = Message {
                sender: self.sender.take(),
                recipients: std::mem::take(&mut self.recipients),
                body: std::mem::take(&mut self.body),
            };
            return DataOutcome::Complete(message);
        }

        // Dot-unstuffing: ".." at line start was an escaped literal dot.
        let content = if line.first() == Some(&b'.') {
            &line[1..]
        } else {
            line
        };
        if !self.body_overflow {
            if self.body.len() + content.len() + 2 > self.config.max_message_size {
                // Keep consuming until the end-of-data marker, but stop
                // buffering.
                self.body_overflow = true;
                self.body.clear();
            } else {
                self.body.extend_from_slice(content);
                self.body.extend_from_slice(b"\r\n");
            }
        }
        DataOutcome::More
    }

    fn cmd_helo(&mut self, args: &str, extended: bool) -> Action {
        if args.is_empty() {
            return self.reject("501 5.5.4 Hostname required\r\n");
        }
        // A new greeting resets any open transaction.
        self.reset_envelope();
        self.helo = Some(args.to_string());
        self.stage = Stage::Greeted;

        let reply = if extended {
            let mut reply = format!("250-{} greets {}\r\n", self.config.hostname, args);
            reply.push_str(&format!("250-SIZE {}\r\n", self.config.max_message_size));
            if self.starttls_available {
                reply.push_str("250-STARTTLS\r\n");
            }
            reply.push_str("250 HELP\r\n");
            reply
        } else {
            format!("250 {}\r\n", self.config.hostname)
        };
        self.accept_owned(reply)
    }

    fn cmd_starttls(&mut self, args: &str) -> Action {
        if !args.is_empty() {
            return self.reject("501 5.5.4 No parameters allowed\r\n");
        }
        if self.tls_active {
            return self.reject("503 5.5.1 TLS already active\r\n");
        }
        if !self.starttls_available {
            return self.reject("454 4.7.0 TLS not available\r\n");
        }
        if !matches!(self.stage, Stage::Connected | Stage::Greeted) {
            return self.reject("503 5.5.1 Finish or reset the transaction first\r\n");
        }
        self.errors = 0;
        Action::StartTls("220 2.0.0 Ready to start TLS\r\n".to_string())
    }

    fn cmd_mail(&mut self, args: &str) -> Action {
        if self.stage == Stage::Connected {
            return self.reject("503 5.5.1 Send HELO/EHLO first\r\n");
        }
        let (path, params) = match parse_path(args, "FROM:") {
            Some(parsed) => parsed,
            None => return self.reject("501 5.5.4 Syntax: MAIL FROM:<address>\r\n"),
        };
        if !path.is_empty() && !valid_address(&path) {
            return self.reject("501 5.1.7 Bad sender address syntax\r\n");
        }
        match declared_size(params) {
            Err(()) => return self.reject("501 5.5.4 Invalid SIZE parameter\r\n"),
            Ok(Some(size)) if size > self.config.max_message_size => {
                return self.reject("552 5.3.4 Message exceeds maximum size\r\n");
            }
            Ok(_) => {}
        }

        self.reset_envelope();
        self.sender = (!path.is_empty()).then_some(path);
        self.stage = Stage::MailFrom;
        self.accept("250 2.1.0 OK\r\n")
    }

    fn cmd_rcpt(&mut self, args: &str, routes: &RouteTable) -> Action {
        if !matches!(self.stage, Stage::MailFrom | Stage::RcptTo) {
            return self.reject("503 5.5.1 Need MAIL before RCPT\r\n");
        }
        let (path, _params) = match parse_path(args, "TO:") {
            Some(parsed) => parsed,
            None => return self.reject("501 5.5.4 Syntax: RCPT TO:<address>\r\n"),
        };
        if !valid_address(&path) {
            return self.reject("501 5.1.3 Bad recipient address syntax\r\n");
        }
        // Unroutable recipients are rejected here, not at delivery time;
        // the session and any other recipients carry on.
        if routes.route(&path).is_none() {
            return self.reject("550 5.1.1 No mailbox for recipient\r\n");
        }
        self.recipients.push(path);
        self.stage = Stage::RcptTo;
        self.accept("250 2.1.5 OK\r\n")
    }

    fn cmd_data(&mut self, args: &str) -> Action {
        if !args.is_empty() {
            return self.reject("501 5.5.4 No parameters allowed\r\n");
        }
        if self.stage != Stage::RcptTo {
            return self.reject("503 5.5.1 Need RCPT before DATA\r\n");
        }
        self.body.clear();
        self.body_overflow = false;
        self.stage = Stage::Data;
        self.errors = 0;
        Action::BeginData("354 Start mail input; end with <CRLF>.<CRLF>\r\n".to_string())
    }

    fn reset_envelope(&mut self) {
        self.sender = None;
        self.recipients.clear();
        self.body.clear();
        self.body_overflow = false;
    }

    fn accept(&mut self, reply: &str) -> Action {
        self.accept_owned(reply.to_string())
    }

    fn accept_owned(&mut self, reply: String) -> Action {
        self.errors = 0;
        Action::Reply(reply)
    }

    fn reject(&mut self, reply: &str) -> Action {
        self.errors += 1;
        if self.errors >= self.config.max_errors {
            Action::Close("421 4.7.0 Too many errors, closing connection\r\n".to_string())
        } else {
            Action::Reply(reply.to_string())
        }
    }
}

/// Extracts the forward/reverse path after a `FROM:`/`TO:` keyword,
/// returning the address and the trailing ESMTP parameter string. The
/// empty address is only valid in its explicit `<>` form.
fn parse_path<'a>(args: &'a str, keyword: &str) -> Option<(String, &'a str)> {
    let rest = args.trim();
    if !rest
        .get(..keyword.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(keyword))
    {
        return None;
    }
    let rest = rest[keyword.len()..].trim_start();
    if let Some(inner) = rest.strip_prefix('<') {
        let (addr, params) = inner.split_once('>')?;
        Some((addr.to_string(), params.trim()))
    } else {
        let mut split = rest.splitn(2, char::is_whitespace);
        let addr = split.next().unwrap_or("");
        if addr.is_empty() {
            return None;
        }
        Some((addr.to_string(), split.next().unwrap_or("").trim()))
    }
}

fn valid_address(addr: &str) -> bool {
    if addr
        .chars()
        .any(|c| c.is_ascii_whitespace() || c.is_ascii_control())
    {
        return false;
    }
    matches!(addr.rsplit_once('@'), Some((local, domain)) if !local.is_empty() && !domain.is_empty())
}

fn declared_size(params: &str) -> Result<Option<usize>, ()> {
    for param in params.split_whitespace() {
        if let Some(value) = param
            .get(..5)
            .filter(|prefix| prefix.eq_ignore_ascii_case("SIZE="))
            .map(|_| &param[5..])
        {
            return value.parse().map(Some).map_err(|_| ());
        }
    }
    Ok(None)
}
