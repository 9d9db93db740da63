/// An accepted message, snapshotted once per completed DATA phase.
///
/// The envelope (sender, recipients) comes from MAIL FROM / RCPT TO and is
/// independent of any addresses inside the body. The body is stored as
/// received, after dot-unstuffing, with CRLF line endings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Reverse path from MAIL FROM. `None` for the null path `<>`.
    pub sender: Option<String>,
    /// Accepted recipients, in RCPT TO order, duplicates preserved.
    pub recipients: Vec<String>,
    pub body: Vec<u8>,
}
