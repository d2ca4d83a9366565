//! Best-effort email notification for key creation and retrieval.
//!
//! Failures here are logged and swallowed; notification must never affect
//! the outcome of an RPC.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use keywarden_core::error::{KeywardenError, KeywardenResult};
use keywarden_core::sysconfig::Sysconfig;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

pub const CFG_EMAIL_AGENT_AND_PORT: &str = "EMAIL_AGENT_AND_PORT";
pub const CFG_EMAIL_AGENT_USERNAME: &str = "EMAIL_AGENT_USERNAME";
pub const CFG_EMAIL_AGENT_PASSWORD: &str = "EMAIL_AGENT_PASSWORD";
pub const CFG_EMAIL_FROM_ADDRESS: &str = "EMAIL_FROM_ADDRESS";
pub const CFG_EMAIL_RECIPIENTS: &str = "EMAIL_RECIPIENTS";
pub const CFG_EMAIL_CREATION_SUBJECT: &str = "EMAIL_KEY_CREATION_SUBJECT";
pub const CFG_EMAIL_CREATION_TEXT: &str = "EMAIL_KEY_CREATION_TEXT";
pub const CFG_EMAIL_RETRIEVAL_SUBJECT: &str = "EMAIL_KEY_RETRIEVAL_SUBJECT";
pub const CFG_EMAIL_RETRIEVAL_TEXT: &str = "EMAIL_KEY_RETRIEVAL_TEXT";

const DEFAULT_CREATION_SUBJECT: &str = "keywarden: a new encryption key was created";
const DEFAULT_RETRIEVAL_SUBJECT: &str = "keywarden: an encryption key was retrieved";

const SMTP_TIMEOUT: Duration = Duration::from_secs(10);

/// SMTP settings plus the notification templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mailer {
    /// Mail agent as `host:port`.
    pub agent_address_port: String,
    pub auth_username: String,
    pub auth_password: String,
    pub from_address: String,
    pub recipients: Vec<String>,
    pub creation_subject: String,
    pub creation_text: String,
    pub retrieval_subject: String,
    pub retrieval_text: String,
}

impl Mailer {
    pub fn from_sysconfig(cfg: &Sysconfig) -> Self {
        Mailer {
            agent_address_port: cfg.get_str(CFG_EMAIL_AGENT_AND_PORT, ""),
            auth_username: cfg.get_str(CFG_EMAIL_AGENT_USERNAME, ""),
            auth_password: cfg.get_str(CFG_EMAIL_AGENT_PASSWORD, ""),
            from_address: cfg.get_str(CFG_EMAIL_FROM_ADDRESS, ""),
            recipients: cfg.get_str_list(CFG_EMAIL_RECIPIENTS),
            creation_subject: cfg.get_str(CFG_EMAIL_CREATION_SUBJECT, DEFAULT_CREATION_SUBJECT),
            creation_text: cfg.get_str(CFG_EMAIL_CREATION_TEXT, ""),
            retrieval_subject: cfg.get_str(CFG_EMAIL_RETRIEVAL_SUBJECT, DEFAULT_RETRIEVAL_SUBJECT),
            retrieval_text: cfg.get_str(CFG_EMAIL_RETRIEVAL_TEXT, ""),
        }
    }

    /// Check that the settings are complete enough to send mail.
    pub fn validate(&self) -> KeywardenResult<()> {
        if self.agent_address_port.is_empty() {
            return Err(KeywardenError::Invalid(
                "mail agent (EMAIL_AGENT_AND_PORT) is not configured".into(),
            ));
        }
        match self.agent_address_port.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => {
                return Err(KeywardenError::Invalid(format!(
                    "mail agent `{}` must look like host:port",
                    self.agent_address_port
                )))
            }
        }
        if self.from_address.is_empty() {
            return Err(KeywardenError::Invalid(
                "sender (EMAIL_FROM_ADDRESS) is not configured".into(),
            ));
        }
        if self.recipients.is_empty() {
            return Err(KeywardenError::Invalid(
                "no notification recipients (EMAIL_RECIPIENTS) configured".into(),
            ));
        }
        Ok(())
    }

    /// Deliver one message to every recipient through the configured agent.
    pub fn send(&self, subject: &str, body: &str) -> KeywardenResult<()> {
        self.validate()?;
        let addr = self
            .agent_address_port
            .to_socket_addrs()
            .map_err(KeywardenError::Io)?
            .next()
            .ok_or_else(|| {
                KeywardenError::Invalid(format!(
                    "mail agent `{}` did not resolve",
                    self.agent_address_port
                ))
            })?;
        let stream = TcpStream::connect_timeout(&addr, SMTP_TIMEOUT)?;
        stream.set_read_timeout(Some(SMTP_TIMEOUT))?;
        stream.set_write_timeout(Some(SMTP_TIMEOUT))?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = stream;

        expect_code(&mut reader, 220)?;
        command(&mut writer, &mut reader, "EHLO keywarden", 250)?;

        if !self.auth_username.is_empty() {
            let token = BASE64.encode(format!(
                "\0{}\0{}",
                self.auth_username, self.auth_password
            ));
            command(&mut writer, &mut reader, &format!("AUTH PLAIN {token}"), 235)?;
        }

        command(
            &mut writer,
            &mut reader,
            &format!("MAIL FROM:<{}>", self.from_address),
            250,
        )?;
        for recipient in &self.recipients {
            command(
                &mut writer,
                &mut reader,
                &format!("RCPT TO:<{recipient}>"),
                250,
            )?;
        }
        command(&mut writer, &mut reader, "DATA", 354)?;

        write!(
            writer,
            "From: <{}>\r\nTo: {}\r\nSubject: {}\r\n\r\n{}\r\n.\r\n",
            self.from_address,
            self.recipients
                .iter()
                .map(|r| format!("<{r}>"))
                .collect::<Vec<_>>()
                .join(", "),
            subject,
            body.replace("\r\n", "\n").replace('\n', "\r\n")
        )?;
        writer.flush()?;
        expect_code(&mut reader, 250)?;
        let _ = command(&mut writer, &mut reader, "QUIT", 221);
        Ok(())
    }
}

fn command<W: Write, R: BufRead>(
    writer: &mut W,
    reader: &mut R,
    line: &str,
    expect: u16,
) -> KeywardenResult<()> {
    write!(writer, "{line}\r\n")?;
    writer.flush()?;
    expect_code(reader, expect)
}

/// Read one (possibly multi-line) SMTP reply and match its status code.
fn expect_code<R: BufRead>(reader: &mut R, expect: u16) -> KeywardenResult<()> {
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(KeywardenError::Io(std::io::Error::other(
                "mail agent closed the connection",
            )));
        }
        let trimmed = line.trim_end();
        let code: u16 = trimmed
            .get(..3)
            .and_then(|head| head.parse().ok())
            .ok_or_else(|| {
                KeywardenError::Invalid(format!("malformed SMTP reply `{trimmed}`"))
            })?;
        let last_line = trimmed.as_bytes().get(3) != Some(&b'-');
        if last_line {
            if code != expect {
                return Err(KeywardenError::Io(std::io::Error::other(format!(
                    "mail agent answered {code}, expected {expect}: {trimmed}"
                ))));
            }
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailer(agent: &str, from: &str, recipients: &[&str]) -> Mailer {
        Mailer {
            agent_address_port: agent.to_string(),
            from_address: from.to_string(),
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            ..Mailer::default()
        }
    }

    #[test]
    fn validate_accepts_complete_settings() {
        assert!(mailer("mail.example:25", "me@a.example", &["a@b.c"])
            .validate()
            .is_ok());
        assert!(mailer("a.example:25", "me@a", &["a@b"]).validate().is_ok());
    }

    #[test]
    fn validate_rejects_incomplete_settings() {
        assert!(mailer("a.example:25", "me@a.example", &[])
            .validate()
            .is_err());
        assert!(mailer("a.example:25", "", &["a@b.c"]).validate().is_err());
        assert!(mailer("a.example", "me@a.example", &["a@b.c"])
            .validate()
            .is_err());
        assert!(mailer("a.example:25a", "me@a.example", &["a@b.c"])
            .validate()
            .is_err());
        assert!(mailer("", "me@a.example", &["a@b.c"]).validate().is_err());
    }

    #[test]
    fn send_fails_when_agent_is_unreachable() {
        let m = mailer("nonexistent.invalid:25", "me@a.example", &["a@b.c"]);
        assert!(m.send("subject", "body").is_err());
    }

    #[test]
    fn from_sysconfig_reads_settings_and_defaults() {
        let empty = Mailer::from_sysconfig(&Sysconfig::default());
        assert!(empty.agent_address_port.is_empty());
        assert!(empty.recipients.is_empty());
        assert_eq!(empty.creation_subject, DEFAULT_CREATION_SUBJECT);

        let mut cfg = Sysconfig::default();
        cfg.set(CFG_EMAIL_RECIPIENTS, "a b");
        cfg.set(CFG_EMAIL_FROM_ADDRESS, "c");
        cfg.set(CFG_EMAIL_AGENT_AND_PORT, "d:25");
        cfg.set(CFG_EMAIL_RETRIEVAL_SUBJECT, "custom subject");
        let m = Mailer::from_sysconfig(&cfg);
        assert_eq!(m.recipients.len(), 2);
        assert_eq!(m.from_address, "c");
        assert_eq!(m.agent_address_port, "d:25");
        assert_eq!(m.retrieval_subject, "custom subject");
    }

    #[test]
    fn smtp_reply_parser_handles_multiline() {
        let mut input = std::io::Cursor::new(b"250-first\r\n250-second\r\n250 done\r\n".to_vec());
        assert!(expect_code(&mut input, 250).is_ok());

        let mut refused = std::io::Cursor::new(b"554 no relay\r\n".to_vec());
        assert!(expect_code(&mut refused, 250).is_err());
    }
}
